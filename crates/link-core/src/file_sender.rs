//! Outbound file transfers.
//!
//! The send-side twin of the reassembler: a blob is cut into indexed,
//! checksummed file packets and handed to the send pipeline, which paces
//! them onto the link. The chunk size is the peer's configured pack size
//! clamped to what the negotiated MTU can carry; the device reassembles
//! by index exactly as this host does for inbound transfers.

use k900_core::{CmdType, max_data_for_mtu};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::send_pipeline::SendQueue;

/// Chunk size for a transfer: the configured pack size, clamped to the
/// MTU budget when one is known.
pub fn effective_pack_size(configured: u16, negotiated_mtu: Option<u16>) -> u16 {
    let configured = configured.max(1);
    match negotiated_mtu.map(max_data_for_mtu) {
        Some(budget) if budget > 0 => configured.min(budget),
        _ => configured,
    }
}

/// Cut `data` into wire-ready file packets.
///
/// Fails on an empty blob or one whose packet count overflows the 16-bit
/// index space at this pack size.
pub fn build_file_packets(
    name: &str,
    data: &[u8],
    pack_size: u16,
    cmd: CmdType,
) -> Result<Vec<Vec<u8>>, LinkError> {
    if data.is_empty() {
        return Err(LinkError::Decoder(k900_core::CodecError::InvalidLength(
            "cannot send an empty file".to_owned(),
        )));
    }
    let pack_size = pack_size.max(1);
    let total = data.len().div_ceil(pack_size as usize);
    if total > usize::from(u16::MAX) {
        return Err(LinkError::Decoder(k900_core::CodecError::InvalidLength(
            format!("{total} packets exceed the 16-bit index space"),
        )));
    }

    let mut packets = Vec::with_capacity(total);
    for (index, chunk) in data.chunks(pack_size as usize).enumerate() {
        let wire = k900_core::encode_file_packet(
            chunk,
            index as u16,
            data.len() as u32,
            name,
            0,
            cmd,
        )
        .map_err(LinkError::Decoder)?;
        packets.push(wire);
    }
    Ok(packets)
}

/// Queue a whole file onto the link. Returns the packet count; the
/// pipeline's pacing spreads the writes out.
pub fn queue_file(
    queue: &SendQueue,
    name: &str,
    data: &[u8],
    pack_size: u16,
    cmd: CmdType,
) -> Result<u32, LinkError> {
    let packets = build_file_packets(name, data, pack_size, cmd)?;
    let total = packets.len() as u32;
    debug!(file = %name, total, bytes = data.len(), "queueing outbound file transfer");
    for wire in packets {
        if !queue.enqueue(wire) {
            warn!(file = %name, "pipeline gone mid-transfer");
            return Err(LinkError::NotConnected);
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
