//! The injected BLE transport capability.
//!
//! The core never touches a platform Bluetooth stack directly. An embedder
//! supplies a [`BleTransport`] implementation plus the receiving half of a
//! [`TransportEvent`] channel. Command-shaped operations (`connect`,
//! `request_mtu`, `write`, ...) are async calls whose resolution is the
//! operation's completion signal — for `write`, that resolution IS the
//! write-complete handshake the send pipeline paces against. Unsolicited
//! happenings (notification data, link loss, scan sightings) arrive as
//! events.

use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// GATT constants
// ---------------------------------------------------------------------------

/// UART-style service the glasses expose.
pub const LINK_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Host→device write characteristic.
pub const LINK_TX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
/// Device→host notify characteristic.
pub const LINK_RX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Floor below which a negotiated MTU gets one retry.
pub const MTU_FLOOR: u16 = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Unsolicited transport happenings, posted to the link task's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan sighting matching the active filter.
    Discovered { name: String, address: String },
    /// Notification data on a subscribed characteristic.
    Notification { characteristic: String, data: Vec<u8> },
    /// The link dropped underneath us.
    LinkDown { reason: String },
}

/// Scan filter: match by advertised-name prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub name_prefix: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The platform has no usable adapter (Bluetooth off, no permission).
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The operation needs an established link.
    #[error("not connected")]
    NotConnected,

    /// Connect attempt failed or timed out at the platform layer.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A write was rejected or lost by the platform layer.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Catch-all for platform errors outside the cases above.
    #[error("transport error: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Platform BLE operations the core drives.
///
/// Implementations must be cancel-safe: the link task may drop a pending
/// future on disconnect. Events must be delivered on the channel handed to
/// the implementation at construction, never by calling back into the core.
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn scan_start(&self, filter: ScanFilter) -> Result<(), TransportError>;

    async fn scan_stop(&self) -> Result<(), TransportError>;

    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Request an MTU; returns the negotiated value, which may be lower.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError>;

    /// Discover services; returns the characteristic UUIDs found under the
    /// link service.
    async fn discover_services(&self) -> Result<Vec<String>, TransportError>;

    /// Subscribe to notifications on a characteristic. Resolves once the
    /// descriptor write completes.
    async fn enable_notifications(&self, characteristic: &str) -> Result<(), TransportError>;

    /// Write `data` to a characteristic. Resolves on write-complete.
    async fn write(&self, characteristic: &str, data: &[u8]) -> Result<(), TransportError>;
}
