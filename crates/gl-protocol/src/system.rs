//! K900 MCU system commands.
//!
//! The BES-side MCU speaks a small command set through the envelope's `C`
//! field as an opaque string, with parameters in `B`. Host→MCU commands
//! are prefixed `cs_`, MCU→host responses `sr_`. These bypass the JSON
//! `type` dispatch entirely.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::envelope::Envelope;

/// Readiness probe, host→MCU. Response: [`CMD_HEARTBEAT_RESP`].
pub const CMD_HEARTBEAT: &str = "cs_hrt";
/// Readiness/heartbeat response, MCU→host, body [`HeartbeatBody`].
pub const CMD_HEARTBEAT_RESP: &str = "sr_hrt";
/// Battery voltage request, host→MCU.
pub const CMD_BATTERY: &str = "cs_batv";
/// Battery voltage response, MCU→host, body [`BatteryBody`].
pub const CMD_BATTERY_RESP: &str = "sr_batv";
/// Device is shutting down; disconnect without reconnecting.
pub const CMD_SHUTDOWN: &str = "sr_shut";

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Body of `sr_hrt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// Battery percentage 0–100.
    #[serde(default)]
    pub pt: u8,
    /// Charging flag, 0/1.
    #[serde(default)]
    pub charg: u8,
    /// Application-processor readiness, 0/1.
    #[serde(default)]
    pub ready: u8,
}

/// Body of `sr_batv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryBody {
    /// Millivolts.
    #[serde(default)]
    pub vt: u32,
    /// Battery percentage 0–100.
    #[serde(default)]
    pub pt: u8,
}

// ---------------------------------------------------------------------------
// Parsed inbound command
// ---------------------------------------------------------------------------

/// An MCU system message fanned out of the inbound envelope stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    Heartbeat(HeartbeatBody),
    Battery(BatteryBody),
    Shutdown,
    /// Known-prefix command this host does not interpret.
    Unknown { command: String, body: Option<Value> },
}

impl SystemMessage {
    /// Interpret an envelope whose `C` field is a command string.
    ///
    /// Returns `None` when `C` is not a string (the envelope is a wrapped
    /// JSON message, not a system command).
    pub fn from_envelope(envelope: &Envelope) -> Option<SystemMessage> {
        let command = envelope.content.as_str()?;
        let body = envelope.body.clone();
        let parsed = match command {
            CMD_HEARTBEAT_RESP => body
                .and_then(|b| serde_json::from_value::<HeartbeatBody>(b).ok())
                .map(SystemMessage::Heartbeat)
                .unwrap_or(SystemMessage::Unknown {
                    command: command.to_owned(),
                    body: None,
                }),
            CMD_BATTERY_RESP => body
                .and_then(|b| serde_json::from_value::<BatteryBody>(b).ok())
                .map(SystemMessage::Battery)
                .unwrap_or(SystemMessage::Unknown {
                    command: command.to_owned(),
                    body: None,
                }),
            CMD_SHUTDOWN => SystemMessage::Shutdown,
            _ => SystemMessage::Unknown {
                command: command.to_owned(),
                body,
            },
        };
        Some(parsed)
    }
}

/// The `cs_hrt` readiness probe envelope content.
pub fn heartbeat_probe() -> Value {
    json!(CMD_HEARTBEAT)
}

/// The `cs_batv` battery poll envelope content.
pub fn battery_probe() -> Value {
    json!(CMD_BATTERY)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
