//! K900 file packets.
//!
//! The indexed, checksummed carrier for large binary blobs (photos, video,
//! audio). Layout on the wire, all multi-byte fields big-endian:
//!
//! ```text
//! ## | type:1 | packSize:2 | packIndex:2 | fileSize:4 |
//!      fileName:16 (zero-padded utf-8) | flags:2 |
//!      data[packSize] | verify:1 | $$
//! ```
//!
//! `verify` is the sum of the data bytes mod 256. A packet whose index is
//! outside `0..⌈fileSize/packSize⌉` is rejected; per-packet reliability is
//! the transport's job, so there are no acks at this layer.

use crate::{CmdType, CodecError, END_MARKER, START_MARKER};

/// Header bytes preceding the data region: markers through flags.
pub const FILE_HEADER_LEN: usize = 29;

/// Width of the zero-padded file name field.
pub const FILE_NAME_LEN: usize = 16;

/// Bytes of framing around the data region: header + verify + end marker.
pub const FILE_PACKET_OVERHEAD: usize = FILE_HEADER_LEN + 3;

/// Largest data chunk a single notification of `mtu` bytes can carry.
///
/// Returns 0 when the MTU cannot fit even a one-byte chunk; senders fall
/// back to their configured pack size in that case rather than emitting
/// empty packets.
pub fn max_data_for_mtu(mtu: u16) -> u16 {
    (mtu as usize).saturating_sub(FILE_PACKET_OVERHEAD) as u16
}

// Field offsets within the packet.
const OFF_TYPE: usize = 2;
const OFF_PACK_SIZE: usize = 3;
const OFF_PACK_INDEX: usize = 5;
const OFF_FILE_SIZE: usize = 7;
const OFF_FILE_NAME: usize = 11;
const OFF_FLAGS: usize = 27;

// ---------------------------------------------------------------------------
// FilePacket
// ---------------------------------------------------------------------------

/// One decoded chunk of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    pub cmd: CmdType,
    pub pack_index: u16,
    pub file_size: u32,
    pub file_name: String,
    pub flags: u16,
    pub data: Vec<u8>,
}

impl FilePacket {
    /// Total packets the declared file size implies at this packet's size.
    ///
    /// The final chunk of a file is usually shorter than the rest, which
    /// makes this an upper bound when computed from that chunk.
    pub fn total_packets(&self) -> u32 {
        if self.data.is_empty() {
            return 0;
        }
        self.file_size.div_ceil(self.data.len() as u32)
    }

    /// File name with its extension stripped (`"I0001.jpg"` → `"I0001"`).
    pub fn file_stem(&self) -> &str {
        match self.file_name.rfind('.') {
            Some(dot) if dot > 0 => &self.file_name[..dot],
            _ => &self.file_name,
        }
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode one chunk of a file transfer.
///
/// `data` is this chunk's bytes (the last chunk may be short), `pack_index`
/// its position, `file_size` the declared total. The name is truncated to
/// 16 bytes on the wire; callers should keep names short and ASCII.
pub fn encode_file_packet(
    data: &[u8],
    pack_index: u16,
    file_size: u32,
    file_name: &str,
    flags: u16,
    cmd: CmdType,
) -> Result<Vec<u8>, CodecError> {
    if data.is_empty() || data.len() > u16::MAX as usize {
        return Err(CodecError::InvalidLength(format!(
            "pack size {} outside 1..=65535",
            data.len()
        )));
    }
    let pack_size = data.len() as u16;
    let total = file_size.div_ceil(u32::from(pack_size));
    if u32::from(pack_index) >= total {
        return Err(CodecError::InvalidLength(format!(
            "pack index {pack_index} out of range for {total} packets"
        )));
    }

    let mut name_field = [0u8; FILE_NAME_LEN];
    let name_bytes = file_name.as_bytes();
    let n = name_bytes.len().min(FILE_NAME_LEN);
    name_field[..n].copy_from_slice(&name_bytes[..n]);

    let mut out = Vec::with_capacity(FILE_HEADER_LEN + data.len() + 3);
    out.extend_from_slice(&START_MARKER);
    out.push(cmd as u8);
    out.extend_from_slice(&pack_size.to_be_bytes());
    out.extend_from_slice(&pack_index.to_be_bytes());
    out.extend_from_slice(&file_size.to_be_bytes());
    out.extend_from_slice(&name_field);
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(data);
    out.push(checksum(data));
    out.extend_from_slice(&END_MARKER);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one file packet from `bytes`.
///
/// Rejects bad checksums and out-of-range pack indices; both indicate a
/// corrupted or hostile stream and the packet must be dropped.
pub fn decode_file_packet(bytes: &[u8]) -> Result<FilePacket, CodecError> {
    if bytes.len() < 2 || bytes[0..2] != START_MARKER {
        return Err(CodecError::NotAFrame);
    }
    if bytes.len() < FILE_HEADER_LEN + 3 {
        return Err(CodecError::Truncated {
            expected: FILE_HEADER_LEN + 3,
            actual: bytes.len(),
        });
    }

    let cmd = CmdType::from_byte(bytes[OFF_TYPE]).ok_or(CodecError::UnknownCommandType(bytes[OFF_TYPE]))?;
    if !cmd.is_file_bearing() {
        return Err(CodecError::UnknownCommandType(bytes[OFF_TYPE]));
    }
    let pack_size = u16::from_be_bytes([bytes[OFF_PACK_SIZE], bytes[OFF_PACK_SIZE + 1]]) as usize;
    let pack_index = u16::from_be_bytes([bytes[OFF_PACK_INDEX], bytes[OFF_PACK_INDEX + 1]]);
    let file_size = u32::from_be_bytes([
        bytes[OFF_FILE_SIZE],
        bytes[OFF_FILE_SIZE + 1],
        bytes[OFF_FILE_SIZE + 2],
        bytes[OFF_FILE_SIZE + 3],
    ]);
    let flags = u16::from_be_bytes([bytes[OFF_FLAGS], bytes[OFF_FLAGS + 1]]);

    if pack_size == 0 {
        return Err(CodecError::InvalidLength("pack size is zero".to_owned()));
    }
    let total_len = FILE_HEADER_LEN + pack_size + 3;
    if bytes.len() < total_len {
        return Err(CodecError::Truncated {
            expected: total_len,
            actual: bytes.len(),
        });
    }

    let end_off = FILE_HEADER_LEN + pack_size + 1;
    if bytes[end_off..end_off + 2] != END_MARKER {
        return Err(CodecError::InvalidEndMarker);
    }

    let data = &bytes[FILE_HEADER_LEN..FILE_HEADER_LEN + pack_size];
    let carried = bytes[FILE_HEADER_LEN + pack_size];
    let computed = checksum(data);
    if computed != carried {
        return Err(CodecError::ChecksumMismatch { computed, carried });
    }

    let total = file_size.div_ceil(pack_size as u32);
    if total == 0 || u32::from(pack_index) >= total {
        return Err(CodecError::InvalidLength(format!(
            "pack index {pack_index} out of range for {total} packets"
        )));
    }

    let name_end = bytes[OFF_FILE_NAME..OFF_FILE_NAME + FILE_NAME_LEN]
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(FILE_NAME_LEN);
    let file_name = std::str::from_utf8(&bytes[OFF_FILE_NAME..OFF_FILE_NAME + name_end])
        .map_err(|_| CodecError::InvalidFileName)?
        .to_owned();

    Ok(FilePacket {
        cmd,
        pack_index,
        file_size,
        file_name,
        flags,
        data: data.to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
