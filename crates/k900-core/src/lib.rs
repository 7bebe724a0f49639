//! K900 wire framing.
//!
//! The K900 protocol frames every exchange between the host and the
//! glasses-side MCU as a length-prefixed packet delimited by `##` / `$$`
//! markers. Two flavors share the structure: generic frames (JSON commands,
//! raw data, audio) and file packets (indexed, checksummed chunks of a
//! larger binary). This crate is the pure codec — no I/O, no async, no
//! envelope semantics. Callers split oversized payloads before framing.
//!
//! # Endianness
//!
//! The two-byte length of a generic frame is little-endian when travelling
//! host→device and big-endian device→host. All file packet fields are
//! big-endian regardless of direction.

pub mod file_packet;
pub mod frame;

pub use file_packet::{
    FILE_HEADER_LEN, FILE_PACKET_OVERHEAD, FilePacket, decode_file_packet, encode_file_packet,
    max_data_for_mtu,
};
pub use frame::{Direction, Frame, decode_frame, encode_raw};

use thiserror::Error;

/// Frame start marker, `b"##"`.
pub const START_MARKER: [u8; 2] = [0x23, 0x23];

/// Frame end marker, `b"$$"`.
pub const END_MARKER: [u8; 2] = [0x24, 0x24];

/// Largest payload a generic frame can carry (16-bit length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

// ---------------------------------------------------------------------------
// Command type byte
// ---------------------------------------------------------------------------

/// The type byte carried in every frame.
///
/// `String` frames carry UTF-8 JSON; the remaining types are file-bearing
/// and arrive as [`FilePacket`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdType {
    String = 0x30,
    Photo = 0x31,
    Video = 0x32,
    Music = 0x33,
    Audio = 0x34,
    Data = 0x35,
}

impl CmdType {
    /// Map a wire byte back to a command type.
    pub fn from_byte(b: u8) -> Option<CmdType> {
        match b {
            0x30 => Some(CmdType::String),
            0x31 => Some(CmdType::Photo),
            0x32 => Some(CmdType::Video),
            0x33 => Some(CmdType::Music),
            0x34 => Some(CmdType::Audio),
            0x35 => Some(CmdType::Data),
            _ => None,
        }
    }

    /// True for the types that carry file packets rather than inline payloads.
    pub fn is_file_bearing(self) -> bool {
        !matches!(self, CmdType::String)
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Decode/encode failures. The codec never panics on hostile input; every
/// malformed byte sequence maps to one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer does not begin with the `##` start marker.
    #[error("not a K900 frame (missing ## start marker)")]
    NotAFrame,

    /// The declared length is inconsistent with the buffer, or a field
    /// (pack size, pack index) is out of its valid range.
    #[error("invalid length field: {0}")]
    InvalidLength(String),

    /// The `$$` end marker is absent from its expected offset.
    #[error("invalid end marker")]
    InvalidEndMarker,

    /// The type byte is not a known command type.
    #[error("unknown command type byte 0x{0:02x}")]
    UnknownCommandType(u8),

    /// The buffer ends before the declared packet does.
    #[error("truncated packet: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A file packet's verify byte does not match the data sum.
    #[error("checksum mismatch: computed 0x{computed:02x}, packet carries 0x{carried:02x}")]
    ChecksumMismatch { computed: u8, carried: u8 },

    /// A file packet's name field is not valid UTF-8.
    #[error("file name is not valid UTF-8")]
    InvalidFileName,

    /// The payload exceeds what a single frame can carry. Callers must
    /// split before framing.
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_PAYLOAD}-byte frame limit")]
    OversizedPayload(usize),
}
