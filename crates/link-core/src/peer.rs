//! Peer identity and per-kind framing parameters.
//!
//! Device variants differ in envelope usage, MTU appetite, and queue
//! tolerance. Rather than subclassing per model, each kind maps to a
//! [`PeerParams`] record consulted by the codec glue, the send pipeline,
//! and the reliable-messaging layer.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PeerKind
// ---------------------------------------------------------------------------

/// The device family on the far side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    /// BES-MCU glasses speaking the full K900 protocol: C-wrap envelopes,
    /// system commands, file packets.
    K900,
    /// Display-only peers with a tiny command buffer; bare JSON frames,
    /// no envelope, capped send queue.
    Display,
}

impl PeerKind {
    /// Storage key for the persisted identity of this kind.
    pub fn storage_key(self) -> &'static str {
        match self {
            PeerKind::K900 => "peer.k900",
            PeerKind::Display => "peer.display",
        }
    }

    /// Advertised-name prefix used to match peers during scans.
    pub fn scan_name_prefix(self) -> &'static str {
        match self {
            PeerKind::K900 => "XyGlasses",
            PeerKind::Display => "XyDisplay",
        }
    }
}

// ---------------------------------------------------------------------------
// PeerIdentity
// ---------------------------------------------------------------------------

/// A known peer: created on first successful link, persisted, updated on
/// reconnect, removed on forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub kind: PeerKind,
    /// Stable BLE address.
    pub address: String,
    /// Advertised display name at last sighting.
    pub name: String,
}

// ---------------------------------------------------------------------------
// PeerParams
// ---------------------------------------------------------------------------

/// Framing and pacing parameters for one peer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerParams {
    /// Whether JSON rides inside the C-wrap envelope.
    pub use_c_wrap: bool,
    /// MTU to request at link-up.
    pub mtu_target: u16,
    /// Chunk size for outbound file transfers.
    pub file_pack_size: u16,
    /// Cap the send queue and drop oldest when full.
    pub constrained_queue: bool,
}

impl PeerParams {
    pub fn for_kind(kind: PeerKind) -> PeerParams {
        match kind {
            PeerKind::K900 => PeerParams {
                use_c_wrap: true,
                mtu_target: 512,
                file_pack_size: 400,
                constrained_queue: false,
            },
            PeerKind::Display => PeerParams {
                use_c_wrap: false,
                mtu_target: 251,
                file_pack_size: 180,
                constrained_queue: true,
            },
        }
    }
}
