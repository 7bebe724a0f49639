//! Typed JSON command payloads.
//!
//! Each struct mirrors one `type` on the wire. Inbound payloads are
//! deserialized from the already-unwrapped JSON object; outbound builders
//! produce the object the reliable-messaging layer stamps `mId` onto.
//! Field names follow the device firmware's casing (mostly camelCase),
//! frozen at v1.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Acknowledgement
// ---------------------------------------------------------------------------

/// `msg_ack` — acknowledges a reliable message by echoing its `mId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgAck {
    #[serde(rename = "mId")]
    pub m_id: u64,
}

impl MsgAck {
    pub fn to_message(&self) -> Value {
        json!({"type": crate::TYPE_MSG_ACK, "mId": self.m_id})
    }
}

// ---------------------------------------------------------------------------
// Device status payloads (inbound)
// ---------------------------------------------------------------------------

/// `battery_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Percentage, 0–100.
    pub level: u8,
    #[serde(default)]
    pub charging: bool,
}

/// `wifi_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiStatus {
    pub connected: bool,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(rename = "localIp", default)]
    pub local_ip: Option<String>,
}

/// `wifi_scan_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiScanResult {
    #[serde(default)]
    pub networks: Vec<String>,
}

/// `version_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "appVersion", default)]
    pub app_version: Option<String>,
    /// Monotonic firmware build number; gates mId/ACK support.
    #[serde(rename = "buildNumber", default)]
    pub build_number: Option<u32>,
    #[serde(rename = "deviceModel", default)]
    pub device_model: Option<String>,
}

/// `button_press`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonPress {
    #[serde(rename = "buttonId")]
    pub button_id: String,
    /// `"short"` or `"long"`.
    #[serde(rename = "pressType", default = "default_press_type")]
    pub press_type: String,
}

fn default_press_type() -> String {
    "short".to_owned()
}

/// `sensor_data` — head-up flag and IMU readings, forwarded opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub sensor: String,
    #[serde(default)]
    pub values: Vec<f64>,
}

/// `pair_failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairFailure {
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// OTA progress (inbound; installation itself is out of scope)
// ---------------------------------------------------------------------------

/// `ota_download_progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaDownloadProgress {
    /// `"STARTED"`, `"PROGRESS"`, `"FINISHED"`, or `"FAILED"`.
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(rename = "bytesDownloaded", default)]
    pub bytes_downloaded: u64,
    #[serde(rename = "totalBytes", default)]
    pub total_bytes: u64,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

/// `ota_installation_progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaInstallationProgress {
    pub status: String,
    #[serde(rename = "apkPath", default)]
    pub apk_path: Option<String>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// `rtmp_stream_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub status: String,
    #[serde(rename = "streamId", default)]
    pub stream_id: Option<String>,
    #[serde(rename = "errorDetails", default)]
    pub error_details: Option<String>,
}

/// `keep_alive_ack` — host→device liveness reply for an active stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveAck {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "ackId", default)]
    pub ack_id: Option<String>,
}

impl KeepAliveAck {
    pub fn to_message(&self) -> Value {
        let mut msg = json!({"type": "keep_alive_ack", "streamId": self.stream_id});
        if let Some(ack_id) = &self.ack_id {
            msg["ackId"] = json!(ack_id);
        }
        msg
    }
}

// ---------------------------------------------------------------------------
// Photo transfer
// ---------------------------------------------------------------------------

/// `take_photo` — host→device request. `bleImgId` names the file the
/// glasses will stream back over the link; the completed blob is posted
/// to `webhookUrl` on the owner's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakePhoto {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "webhookUrl", default)]
    pub webhook_url: Option<String>,
    /// `"small"`, `"medium"`, or `"large"`.
    #[serde(default = "default_photo_size")]
    pub size: String,
    #[serde(rename = "bleImgId")]
    pub ble_img_id: String,
    #[serde(rename = "transferMethod", default = "default_transfer_method")]
    pub transfer_method: String,
}

fn default_photo_size() -> String {
    "medium".to_owned()
}

fn default_transfer_method() -> String {
    "auto".to_owned()
}

impl TakePhoto {
    pub fn to_message(&self) -> Value {
        json!({
            "type": "take_photo",
            "requestId": self.request_id,
            "webhookUrl": self.webhook_url,
            "size": self.size,
            "bleImgId": self.ble_img_id,
            "transferMethod": self.transfer_method,
        })
    }
}

/// `ble_photo_ready` — device signal that compression finished and the
/// file transfer is about to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlePhotoReady {
    #[serde(rename = "bleImgId")]
    pub ble_img_id: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(rename = "compressionDurationMs", default)]
    pub compression_duration_ms: Option<u64>,
}

/// `ble_photo_complete` — device-side bookkeeping signal after the last
/// packet; assembly completion is authoritative on the host side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlePhotoComplete {
    #[serde(rename = "bleImgId")]
    pub ble_img_id: String,
    #[serde(default)]
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Outbound control builders
// ---------------------------------------------------------------------------

/// `set_mic_state`.
pub fn set_mic_state(enabled: bool) -> Value {
    json!({"type": "set_mic_state", "enabled": enabled})
}

/// `display_text` — minimal text render request.
pub fn display_text(text: &str) -> Value {
    json!({"type": "display_text", "text": text})
}

/// `request_battery_state` — polled on the battery heartbeat cadence.
pub fn request_battery_state() -> Value {
    json!({"type": "request_battery_state"})
}

/// `request_wifi_scan`.
pub fn request_wifi_scan() -> Value {
    json!({"type": "request_wifi_scan"})
}

/// `send_wifi_credentials`.
pub fn send_wifi_credentials(ssid: &str, password: &str) -> Value {
    json!({"type": "send_wifi_credentials", "ssid": ssid, "password": password})
}

/// `ping` — fire-and-forget heartbeat.
pub fn ping() -> Value {
    json!({"type": crate::TYPE_PING})
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
