// gl-protocol: JSON message types and the K900 C-wrap envelope.
//
// Every JSON command has a top-level `type` field for discriminated
// routing. Reliable messages additionally carry `mId`. The wire literals
// in this crate are frozen; renaming any of them breaks fielded devices.

pub mod device_message;
pub mod envelope;
pub mod messages;
pub mod system;

pub use device_message::DeviceMessage;
pub use envelope::{Envelope, encode_json, unwrap_envelope, wrap_message};

/// Key carrying the per-message identity on reliable messages.
pub const MSG_ID_FIELD: &str = "mId";

/// `type` value acknowledging a reliable message; echoes the `mId`.
pub const TYPE_MSG_ACK: &str = "msg_ack";

/// `type` value the device sends once its application processor is up.
pub const TYPE_GLASSES_READY: &str = "glasses_ready";

/// Post-readiness heartbeat and its response.
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";
