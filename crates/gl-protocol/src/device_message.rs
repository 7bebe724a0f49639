//! Typed view of device→host JSON messages.
//!
//! The dispatcher routes on raw `type` strings so unknown commands degrade
//! to a logged miss, but consumers that want exhaustive matching — and
//! test fixtures that emulate the glasses — work with this enum instead
//! of hand-built JSON. The variant set mirrors the frozen v1 command
//! vocabulary; a tag outside it fails to parse, which callers treat as
//! "unknown, leave it to the string path".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{
    BatteryStatus, BlePhotoComplete, BlePhotoReady, ButtonPress, MsgAck, OtaDownloadProgress,
    OtaInstallationProgress, PairFailure, SensorData, StreamStatus, VersionInfo, WifiScanResult,
    WifiStatus,
};

/// One device→host command, discriminated by the wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    MsgAck(MsgAck),
    GlassesReady {},
    Pong {},
    BatteryStatus(BatteryStatus),
    WifiStatus(WifiStatus),
    WifiScanResult(WifiScanResult),
    VersionInfo(VersionInfo),
    BlePhotoReady(BlePhotoReady),
    BlePhotoComplete(BlePhotoComplete),
    OtaDownloadProgress(OtaDownloadProgress),
    OtaInstallationProgress(OtaInstallationProgress),
    RtmpStreamStatus(StreamStatus),
    ButtonPress(ButtonPress),
    SensorData(SensorData),
    PairFailure(PairFailure),
}

impl DeviceMessage {
    /// Parse an unwrapped JSON object; `None` for unknown or malformed
    /// commands (the string-keyed dispatcher remains the fallback).
    pub fn parse(value: &Value) -> Option<DeviceMessage> {
        serde_json::from_value(value.clone()).ok()
    }

    /// The wire JSON for this message.
    pub fn to_value(&self) -> Value {
        // Tagged-enum serialization of these shapes cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
