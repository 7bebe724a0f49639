//! The K900 C-wrap envelope.
//!
//! Host and device exchange JSON inside a single-character-keyed envelope:
//! `C` holds the content (a JSON object, or an opaque command string for
//! MCU system messages), `V` an optional version, `B` an optional body
//! object, and `W` a wake-up flag the host sets on messages that must
//! interrupt device low-power. On receive, envelopes carrying only `C`
//! are unwrapped until a plain object remains.

use k900_core::{CmdType, CodecError, Direction, encode_raw};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version emitted by this host.
pub const ENVELOPE_VERSION: i64 = 1;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Typed view of the C-wrap. Field names are the wire's single characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "C")]
    pub content: Value,

    #[serde(rename = "V", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(rename = "B", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(rename = "W", default, skip_serializing_if = "Option::is_none")]
    pub wake: Option<i64>,
}

impl Envelope {
    /// True when `C` holds an MCU system command string (`"sr_hrt"`, ...)
    /// rather than a nested JSON object.
    pub fn is_system_command(&self) -> bool {
        self.content.is_string()
    }
}

/// Wrap a message for transmission: `{"C": msg}` plus `"W":1` when waking.
pub fn wrap_message(msg: Value, wake: bool) -> Envelope {
    Envelope {
        content: msg,
        version: None,
        body: None,
        wake: wake.then_some(1),
    }
}

/// Peel C-wraps until a plain value remains.
///
/// An envelope whose only key is `C` is pure wrapping and is removed
/// recursively; once any sibling key (`V`, `B`, `W`, or anything else)
/// appears, the value is returned as-is for the dispatcher to interpret.
pub fn unwrap_envelope(value: Value) -> Value {
    let mut current = value;
    loop {
        let inner = match &current {
            Value::Object(map) if map.len() == 1 && map.contains_key("C") => {
                map.get("C").cloned()
            }
            _ => None,
        };
        match inner {
            Some(v) => current = v,
            None => return current,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON framing
// ---------------------------------------------------------------------------

/// Serialize `msg` into a K900 `String` frame, C-wrapped.
///
/// The wake flag is only meaningful host→device; it is ignored for the
/// device direction (used by test fixtures emulating the glasses).
pub fn encode_json(msg: &Value, wake: bool, direction: Direction) -> Result<Vec<u8>, CodecError> {
    let envelope = wrap_message(msg.clone(), wake && direction == Direction::HostToDevice);
    let bytes = serde_json::to_vec(&envelope).map_err(|e| {
        // serde_json only fails here on non-string map keys, which `Value`
        // cannot represent; keep the error path total anyway.
        CodecError::InvalidLength(format!("JSON serialization failed: {e}"))
    })?;
    encode_raw(&bytes, CmdType::String, direction)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
