//! In-process event bus.
//!
//! Dispatcher outputs and lifecycle changes fan out to owners through a
//! broadcast channel of typed events. Publishing never blocks; slow
//! subscribers lag and skip, which is acceptable because every event is
//! advisory — authoritative state lives in the link task.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::connection::PublicState;

/// Default depth of the broadcast channel.
const BUS_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// LinkEvent
// ---------------------------------------------------------------------------

/// Everything the core tells its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnectionStateChanged(PublicState),
    /// A scan sighting (inventory scans publish every match).
    PeerDiscovered { name: String, address: String },
    BatteryChanged { level: u8, charging: bool },
    /// Battery voltage detail from the MCU, when available.
    BatteryVoltage { millivolts: u32, level: u8 },
    WifiStatusChanged { connected: bool, ssid: Option<String> },
    WifiScanResult { networks: Vec<String> },
    /// Device finished compressing; BLE transfer is starting.
    PhotoReady { ble_img_id: String, request_id: Option<String> },
    /// Assembled photo delivered (and uploaded, when a webhook was set).
    PhotoComplete {
        request_id: String,
        size_bytes: usize,
        compression_ms: Option<u64>,
        ble_transfer_ms: u64,
        total_ms: u64,
    },
    VersionInfo { app_version: Option<String>, build_number: Option<u32> },
    OtaDownloadProgress { status: String, progress: u8 },
    OtaInstallationProgress { status: String },
    StreamStatus { status: String, stream_id: Option<String> },
    ButtonPress { button_id: String, press_type: String },
    SensorData { sensor: String, values: Vec<f64> },
    PairFailure { error: Option<String> },
    /// Bring-up aborted: un-ready peer below the battery floor.
    PairingBatteryTooLow { level: u8 },
    /// Readiness probes exhausted without `glasses_ready`.
    ReadinessFailed { probes: u32 },
    /// Retries exhausted for a reliable message.
    DeliveryFailed { m_id: u64 },
    /// A non-photo file finished reassembly.
    FileReceived { name: String, kind: FileKind, data: Vec<u8> },
    /// One raw microphone audio frame (unframed PCM/LC3 chunk).
    MicAudioChunk { data: Vec<u8> },
    /// A file-transfer session went idle past the timeout.
    SessionAbandoned { name: String, received: u32, total: u32 },
    /// Constrained-peer queue overflowed; oldest entries were dropped.
    QueueDropped { count: u64 },
    /// Webhook POST failed for a completed photo.
    WebhookUploadFailed { request_id: String, reason: String },
}

/// Coarse category of a received file, derived from the packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Photo,
    Video,
    Audio,
    Music,
    Data,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Cloneable publish handle plus subscription factory.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. A bus with no subscribers swallows it.
    pub fn publish(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Stream-flavored subscription for `StreamExt`-style consumers.
    pub fn stream(&self) -> BroadcastStream<LinkEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
