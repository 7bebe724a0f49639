//! Link error taxonomy.
//!
//! Everything fallible in the core returns one of these; no exceptions for
//! control flow. Fatal conditions tear down the link; recoverable ones are
//! retried per the owning component's policy.

use k900_core::CodecError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The transport adapter reports no link capability at all. The
    /// reconnect loop is paused until the owner intervenes.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No matching peer appeared before the scan window closed.
    #[error("scan timed out after {seconds}s")]
    ScanTimeout { seconds: u64 },

    /// GATT service discovery failed outright.
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The peer lacks the required service/characteristics. Fatal for this
    /// peer identity; no automatic reconnect.
    #[error("required services missing on peer")]
    ServicesMissing,

    /// A packet failed to decode. Dropped and counted; a sustained burst
    /// on a connected link is treated as transport corruption.
    #[error(transparent)]
    Decoder(#[from] CodecError),

    /// Caller handed the codec a payload that cannot fit one frame.
    #[error("payload of {0} bytes exceeds the frame limit; split before sending")]
    OversizedPayload(usize),

    /// Retries exhausted without an ACK. The link itself stays up.
    #[error("no ACK for message {m_id} after {retries} retries")]
    AckTimeout { m_id: u64, retries: u32 },

    /// The device never reported ready during bring-up.
    #[error("device not ready after {probes} probes")]
    ReadinessFailed { probes: u32 },

    /// Bring-up aborted: the peer is not ready and too low on battery to
    /// finish pairing.
    #[error("pairing aborted: peer battery at {level}%")]
    PairingBatteryTooLow { level: u8 },

    /// Webhook POST for a completed photo transfer failed.
    #[error("webhook upload failed: {0}")]
    WebhookUploadFailed(String),

    /// Operation requires an established link.
    #[error("not connected")]
    NotConnected,

    /// The link task is gone; the handle is stale.
    #[error("link task has shut down")]
    ChannelClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(String),
}
