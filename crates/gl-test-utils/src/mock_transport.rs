//! A mock BLE transport playing the part of the glasses.
//!
//! Implements the [`BleTransport`] capability with an in-memory device
//! model: scripted scan sightings, configurable MTU and service tables,
//! and reactive behavior for inbound writes (heartbeat-probe responses,
//! readiness after N probes, automatic `msg_ack`s with optional loss).
//! Tests drive the device side through the `send_*_from_device` helpers
//! and inspect everything the host wrote.
//!
//! # Behavior knobs
//!
//! - `advertised` peers are emitted as sightings on every `scan_start`.
//! - `auto_ready_after_probes`: reply `glasses_ready` once the Nth
//!   readiness probe arrives.
//! - `respond_heartbeat`: answer `cs_hrt` with an `sr_hrt` carrying the
//!   configured battery/ready bits.
//! - `auto_ack` + `drop_acks_first_n`: acknowledge reliable messages,
//!   optionally losing the first N (for retry tests).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use gl_protocol::DeviceMessage;
use gl_protocol::envelope::{encode_json, unwrap_envelope};
use k900_core::{CmdType, Direction};
use link_core::transport::{
    BleTransport, LINK_RX_CHAR_UUID, LINK_TX_CHAR_UUID, ScanFilter, TransportError, TransportEvent,
};

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Scripted device behavior; tweak before (or during) a test.
#[derive(Debug, Clone)]
pub struct MockDeviceBehavior {
    /// (name, address) pairs emitted on scan_start.
    pub advertised: Vec<(String, String)>,
    /// MTU granted regardless of the requested value.
    pub mtu_granted: u16,
    /// Characteristics reported by service discovery.
    pub characteristics: Vec<String>,
    /// Fail this many connect attempts before succeeding.
    pub fail_connect_times: u32,
    /// Reply `glasses_ready` once this many readiness probes have arrived.
    pub auto_ready_after_probes: Option<u32>,
    /// Answer `cs_hrt` probes with `sr_hrt`.
    pub respond_heartbeat: bool,
    pub battery_level: u8,
    pub battery_charging: bool,
    /// Readiness bit carried in `sr_hrt`.
    pub heartbeat_ready: bool,
    /// Acknowledge inbound reliable messages.
    pub auto_ack: bool,
    /// Lose the ACKs for the first N reliable transmissions.
    pub drop_acks_first_n: u32,
}

impl Default for MockDeviceBehavior {
    fn default() -> Self {
        MockDeviceBehavior {
            advertised: vec![("XyGlasses-1F2A".to_owned(), "AA:BB:CC:DD:EE:FF".to_owned())],
            mtu_granted: 247,
            characteristics: vec![LINK_TX_CHAR_UUID.to_owned(), LINK_RX_CHAR_UUID.to_owned()],
            fail_connect_times: 0,
            auto_ready_after_probes: Some(1),
            respond_heartbeat: true,
            battery_level: 85,
            battery_charging: false,
            heartbeat_ready: true,
            auto_ack: true,
            drop_acks_first_n: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    subscribed: bool,
    scanning: bool,
    connect_attempts: u32,
    probes_seen: u32,
    ready_sent: bool,
    acks_dropped: u32,
    /// Raw bytes of every host write, in order.
    writes: Vec<Vec<u8>>,
    /// `mId`s the host has acknowledged back to the device.
    host_acks: Vec<u64>,
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// The mock transport. Create with [`MockTransport::start`], hand the
/// returned receiver to `LinkManager`, and keep the `Arc` for scripting.
pub struct MockTransport {
    behavior: Mutex<MockDeviceBehavior>,
    state: Mutex<MockState>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn start(behavior: MockDeviceBehavior) -> (Arc<MockTransport>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let transport = Arc::new(MockTransport {
            behavior: Mutex::new(behavior),
            state: Mutex::new(MockState::default()),
            event_tx,
        });
        (transport, event_rx)
    }

    pub fn with_defaults() -> (Arc<MockTransport>, mpsc::Receiver<TransportEvent>) {
        Self::start(MockDeviceBehavior::default())
    }

    // -----------------------------------------------------------------------
    // Device-side drivers
    // -----------------------------------------------------------------------

    /// Emit a device→host JSON message, C-wrapped and framed big-endian.
    pub async fn send_json_from_device(&self, msg: &Value) {
        let wire = encode_json(msg, false, Direction::DeviceToHost).expect("test message frames");
        self.notify(wire).await;
    }

    /// Typed flavor of [`Self::send_json_from_device`].
    pub async fn send_message_from_device(&self, msg: &DeviceMessage) {
        self.send_json_from_device(&msg.to_value()).await;
    }

    /// Emit a raw envelope value (for system commands and malformed shapes).
    pub async fn send_envelope_from_device(&self, envelope: &Value) {
        let bytes = serde_json::to_vec(envelope).expect("test envelope serializes");
        let wire = k900_core::encode_raw(&bytes, CmdType::String, Direction::DeviceToHost)
            .expect("test envelope frames");
        self.notify(wire).await;
    }

    /// Emit an MCU system message: `{"C": cmd, "B": body}`.
    pub async fn send_system_from_device(&self, cmd: &str, body: Option<Value>) {
        let mut envelope = serde_json::json!({"C": cmd});
        if let Some(body) = body {
            envelope["B"] = body;
        }
        self.send_envelope_from_device(&envelope).await;
    }

    /// Stream a file to the host in `pack_size` chunks.
    pub async fn send_file_from_device(
        &self,
        name: &str,
        data: &[u8],
        pack_size: usize,
        cmd: CmdType,
    ) {
        for (index, chunk) in data.chunks(pack_size).enumerate() {
            let wire = k900_core::encode_file_packet(
                chunk,
                index as u16,
                data.len() as u32,
                name,
                0,
                cmd,
            )
            .expect("test file packet encodes");
            self.notify(wire).await;
        }
    }

    /// Emit one arbitrary notification payload.
    pub async fn send_raw_from_device(&self, bytes: Vec<u8>) {
        self.notify(bytes).await;
    }

    /// Drop the link out from under the host.
    pub async fn emit_link_down(&self, reason: &str) {
        {
            let mut state = self.lock_state();
            state.connected = false;
            state.subscribed = false;
        }
        let _ = self
            .event_tx
            .send(TransportEvent::LinkDown {
                reason: reason.to_owned(),
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock_state().writes.clone()
    }

    /// Host writes decoded to plain JSON (envelopes unwrapped). Non-JSON
    /// writes (file packets) are skipped.
    pub fn decoded_writes(&self) -> Vec<Value> {
        self.lock_state()
            .writes
            .iter()
            .filter_map(|w| decode_host_json(w))
            .collect()
    }

    /// Host writes decoded as file packets (outbound file transfers).
    pub fn file_writes(&self) -> Vec<k900_core::FilePacket> {
        self.lock_state()
            .writes
            .iter()
            .filter_map(|w| k900_core::decode_file_packet(w).ok())
            .collect()
    }

    /// `mId`s the host acknowledged to the device.
    pub fn host_acks(&self) -> Vec<u64> {
        self.lock_state().host_acks.clone()
    }

    pub fn probes_seen(&self) -> u32 {
        self.lock_state().probes_seen
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock_state().connect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    pub fn is_scanning(&self) -> bool {
        self.lock_state().scanning
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock_state().subscribed
    }

    pub fn set_behavior<F: FnOnce(&mut MockDeviceBehavior)>(&self, update: F) {
        update(&mut self.behavior.lock().expect("behavior mutex"));
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("state mutex")
    }

    fn behavior_snapshot(&self) -> MockDeviceBehavior {
        self.behavior.lock().expect("behavior mutex").clone()
    }

    async fn notify(&self, data: Vec<u8>) {
        let _ = self
            .event_tx
            .send(TransportEvent::Notification {
                characteristic: LINK_RX_CHAR_UUID.to_owned(),
                data,
            })
            .await;
    }

    /// Device-model reaction to one host write.
    async fn react(&self, data: &[u8]) {
        let Some(msg) = decode_host_json(data) else {
            return;
        };
        let behavior = self.behavior_snapshot();

        // System probes ride the envelope as a bare string.
        if let Some(cmd) = msg.as_str() {
            match cmd {
                "cs_hrt" => {
                    let ready_due = {
                        let mut state = self.lock_state();
                        state.probes_seen += 1;
                        let due = behavior
                            .auto_ready_after_probes
                            .is_some_and(|n| state.probes_seen >= n && !state.ready_sent);
                        if due {
                            state.ready_sent = true;
                        }
                        due
                    };
                    if behavior.respond_heartbeat {
                        self.send_system_from_device(
                            "sr_hrt",
                            Some(serde_json::json!({
                                "pt": behavior.battery_level,
                                "charg": u8::from(behavior.battery_charging),
                                "ready": u8::from(behavior.heartbeat_ready),
                            })),
                        )
                        .await;
                    }
                    if ready_due {
                        self.send_json_from_device(&serde_json::json!({"type": "glasses_ready"}))
                            .await;
                    }
                }
                "cs_batv" => {
                    self.send_system_from_device(
                        "sr_batv",
                        Some(serde_json::json!({"vt": 3910, "pt": behavior.battery_level})),
                    )
                    .await;
                }
                _ => {}
            }
            return;
        }

        let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();

        // Plain-JSON readiness probe (peers without the envelope).
        if msg_type == "phone_ready" {
            let ready_due = {
                let mut state = self.lock_state();
                state.probes_seen += 1;
                let due = behavior
                    .auto_ready_after_probes
                    .is_some_and(|n| state.probes_seen >= n && !state.ready_sent);
                if due {
                    state.ready_sent = true;
                }
                due
            };
            if ready_due {
                self.send_json_from_device(&serde_json::json!({"type": "glasses_ready"}))
                    .await;
            }
            return;
        }

        if msg_type == "msg_ack" {
            if let Some(id) = msg.get("mId").and_then(Value::as_u64) {
                self.lock_state().host_acks.push(id);
            }
            return;
        }

        // Reliable message: acknowledge unless scripted to lose it.
        if let Some(id) = msg.get("mId").and_then(Value::as_u64) {
            if behavior.auto_ack {
                let lose = {
                    let mut state = self.lock_state();
                    if state.acks_dropped < behavior.drop_acks_first_n {
                        state.acks_dropped += 1;
                        true
                    } else {
                        false
                    }
                };
                if !lose {
                    self.send_json_from_device(&serde_json::json!({"type": "msg_ack", "mId": id}))
                        .await;
                }
            }
        }
    }
}

/// Decode a host→device write into its JSON payload, unwrapping the
/// envelope but preserving bare system-command strings.
fn decode_host_json(data: &[u8]) -> Option<Value> {
    let frame = k900_core::decode_frame(data, Direction::HostToDevice).ok()?;
    if frame.cmd != CmdType::String {
        return None;
    }
    let value: Value = serde_json::from_slice(&frame.payload).ok()?;
    Some(unwrap_envelope(value))
}

// ---------------------------------------------------------------------------
// BleTransport impl
// ---------------------------------------------------------------------------

#[async_trait]
impl BleTransport for MockTransport {
    async fn scan_start(&self, filter: ScanFilter) -> Result<(), TransportError> {
        let sightings: Vec<(String, String)> = {
            let mut state = self.lock_state();
            state.scanning = true;
            self.behavior_snapshot()
                .advertised
                .into_iter()
                .filter(|(name, _)| name.starts_with(&filter.name_prefix))
                .collect()
        };
        for (name, address) in sightings {
            let _ = self
                .event_tx
                .send(TransportEvent::Discovered { name, address })
                .await;
        }
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), TransportError> {
        self.lock_state().scanning = false;
        Ok(())
    }

    async fn connect(&self, _address: &str) -> Result<(), TransportError> {
        self.lock_state().connect_attempts += 1;
        {
            let mut behavior = self.behavior.lock().expect("behavior mutex");
            if behavior.fail_connect_times > 0 {
                behavior.fail_connect_times -= 1;
                return Err(TransportError::ConnectFailed("scripted failure".to_owned()));
            }
        }
        let mut state = self.lock_state();
        state.connected = true;
        state.probes_seen = 0;
        state.ready_sent = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock_state();
        state.connected = false;
        state.subscribed = false;
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16, TransportError> {
        Ok(self.behavior_snapshot().mtu_granted)
    }

    async fn discover_services(&self) -> Result<Vec<String>, TransportError> {
        if !self.lock_state().connected {
            return Err(TransportError::NotConnected);
        }
        Ok(self.behavior_snapshot().characteristics)
    }

    async fn enable_notifications(&self, _characteristic: &str) -> Result<(), TransportError> {
        let mut state = self.lock_state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscribed = true;
        Ok(())
    }

    async fn write(&self, _characteristic: &str, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.lock_state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.writes.push(data.to_vec());
        }
        self.react(data).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
