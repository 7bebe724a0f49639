//! Connection state machine and link task.
//!
//! One tokio task per link owns every piece of mutable link state: the
//! state machine, the pending-ACK table, the duplicate cache, the
//! reassembler, the dispatcher, and the photo-transfer table. Owner
//! commands, transport events, bring-up milestones, and timer firings all
//! arrive through the task's mailbox, so no two of them ever race. Timers
//! are spawned sleeps that post back into the mailbox tagged with a link
//! epoch; bumping the epoch on disconnect retires every outstanding timer
//! without tracking handles.
//!
//! # Bring-up
//!
//! ```text
//! DISCONNECTED → SCANNING (address unknown) → CONNECTING → LINK_ESTABLISHED
//!   → SERVICES_RESOLVED → NOTIFICATIONS_READY → AWAITING_DEVICE_READY
//!   → CONNECTED (on glasses_ready)
//! ```
//!
//! Long-running transport operations (connect, MTU, discovery, subscribe)
//! run on a spawned bring-up driver that reports milestones into the
//! mailbox; the link task itself never blocks on I/O.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use gl_protocol::envelope::{Envelope, encode_json, unwrap_envelope};
use gl_protocol::messages::{self, BlePhotoReady, MsgAck, TakePhoto, VersionInfo};
use gl_protocol::system::{self, SystemMessage};
use k900_core::{CmdType, CodecError, Direction, FilePacket};

use crate::bus::{EventBus, FileKind, LinkEvent};
use crate::config::LinkConfig;
use crate::dispatch::{CommandHandler, Dispatcher};
use crate::error::LinkError;
use crate::file_sender;
use crate::handlers;
use crate::heartbeat::{HeartbeatSchedule, ProbeStep, ReadinessProber};
use crate::peer::{PeerIdentity, PeerKind, PeerParams};
use crate::prefs::Preferences;
use crate::reassembly::{IngestOutcome, Reassembler};
use crate::registry::PeerRegistry;
use crate::reliable::{AckTracker, DuplicateCache, MessageIdGenerator, RetryDecision};
use crate::send_pipeline::{self, PipelineSettings, PipelineSignal, SendQueue};
use crate::storage::KvStore;
use crate::transport::{
    BleTransport, LINK_RX_CHAR_UUID, LINK_TX_CHAR_UUID, MTU_FLOOR, ScanFilter, TransportError,
    TransportEvent,
};
use crate::upload::{BlePhotoTransfer, HttpPoster, PhotoTransferTable, upload_photo};

/// Platform connect attempts are abandoned after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Internal connection state, full resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    LinkEstablished,
    ServicesResolved,
    NotificationsReady,
    AwaitingDeviceReady,
    Connected,
}

/// The three-state projection external collaborators see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicState {
    Disconnected,
    Connecting,
    Connected,
}

fn project(state: ConnectionState) -> PublicState {
    match state {
        ConnectionState::Disconnected => PublicState::Disconnected,
        ConnectionState::Connected => PublicState::Connected,
        _ => PublicState::Connecting,
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

enum LinkCommand {
    Connect {
        kind: PeerKind,
        address: Option<String>,
    },
    Disconnect,
    Forget,
    ScanInventory,
    ScanStop,
    SendJson {
        msg: Value,
        reliable: bool,
        wake: bool,
        reply: Option<oneshot::Sender<Result<Option<u64>, LinkError>>>,
    },
    TakePhoto {
        request: TakePhoto,
        auth_token: Option<String>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    SendFile {
        name: String,
        data: Vec<u8>,
        cmd: CmdType,
        reply: oneshot::Sender<Result<u32, LinkError>>,
    },
    RegisterHandler {
        msg_type: String,
        handler: Box<dyn CommandHandler>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ScanTimeout,
    AckCheck { m_id: u64 },
    ReadinessProbe,
    Heartbeat,
    Reconnect,
    SessionSweep,
    PendingCleanup,
}

#[derive(Debug)]
enum BringUpStep {
    LinkUp,
    Mtu { negotiated: u16 },
    Services { ok: bool },
    NotificationsReady,
    Failed { stage: &'static str, error: TransportError },
}

enum Mail {
    Cmd(LinkCommand),
    Transport(TransportEvent),
    Timer { epoch: u64, kind: TimerKind },
    BringUp { epoch: u64, step: BringUpStep },
    Pipeline(PipelineSignal),
}

// ---------------------------------------------------------------------------
// Manager / handle
// ---------------------------------------------------------------------------

/// Injected capabilities for one link.
pub struct LinkManager {
    pub transport: Arc<dyn BleTransport>,
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub http: Arc<dyn HttpPoster>,
    pub store: Arc<dyn KvStore>,
    pub config: LinkConfig,
}

impl LinkManager {
    /// Spawn the link task and return the owner handle.
    pub fn spawn(self) -> LinkHandle {
        let bus = EventBus::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (mail_tx, mail_rx) = mpsc::unbounded_channel::<Mail>();
        let (public_tx, public_rx) = watch::channel(PublicState::Disconnected);

        // Forward owner commands into the mailbox.
        let mail_from_cmd = mail_tx.clone();
        tokio::spawn(async move {
            let mut cmd_rx = cmd_rx;
            while let Some(cmd) = cmd_rx.recv().await {
                if mail_from_cmd.send(Mail::Cmd(cmd)).is_err() {
                    break;
                }
            }
        });

        // Forward transport events into the mailbox.
        let mail_from_transport = mail_tx.clone();
        let mut transport_events = self.transport_events;
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                if mail_from_transport.send(Mail::Transport(event)).is_err() {
                    break;
                }
            }
        });

        let mut dispatcher = Dispatcher::new();
        handlers::install_builtin_handlers(&mut dispatcher, &bus);
        handlers::install_legacy_aliases(&mut dispatcher);

        let task = LinkTask {
            config: self.config.clone(),
            transport: self.transport,
            http: self.http,
            prefs: Preferences::new(self.store.clone()),
            registry: PeerRegistry::new(self.store),
            bus: bus.clone(),
            mail_tx,
            public_tx,
            state: ConnectionState::Disconnected,
            epoch: 0,
            target_kind: None,
            target_address: None,
            peer_name: None,
            params: PeerParams::for_kind(PeerKind::K900),
            fw_build: None,
            negotiated_mtu: None,
            id_gen: MessageIdGenerator::new(),
            tracker: AckTracker::new(self.config.max_retries),
            dup_cache: DuplicateCache::new(self.config.duplicate_window),
            reassembler: Reassembler::new(self.config.session_inactivity_timeout),
            dispatcher,
            photo_table: PhotoTransferTable::new(),
            pipeline: None,
            prober: ReadinessProber::new(self.config.readiness_max_probes),
            heartbeats: HeartbeatSchedule::new(self.config.battery_every_n_heartbeats),
            reconnect_attempts: 0,
            reconnect_enabled: true,
            decoder_errors: VecDeque::new(),
            scan_is_inventory: false,
        };
        tokio::spawn(task.run(mail_rx));

        LinkHandle {
            cmd_tx,
            bus,
            public_rx,
        }
    }
}

/// Owner-side handle to a running link task.
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    bus: EventBus,
    public_rx: watch::Receiver<PublicState>,
}

impl LinkHandle {
    fn send_cmd(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        self.cmd_tx.send(cmd).map_err(|_| LinkError::ChannelClosed)
    }

    /// Connect to a peer of `kind`. With no address, the persisted
    /// identity is used; failing that, a targeted scan runs first.
    pub fn connect(&self, kind: PeerKind, address: Option<String>) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::Connect { kind, address })
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::Disconnect)
    }

    /// Clear the persisted peer identity and stop reconnecting.
    pub fn forget(&self) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::Forget)
    }

    /// Start an inventory scan; every sighting lands on the bus.
    pub fn scan_inventory(&self) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::ScanInventory)
    }

    pub fn scan_stop(&self) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::ScanStop)
    }

    /// Fire-and-forget JSON send.
    pub fn send_json(&self, msg: Value, wake: bool) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::SendJson {
            msg,
            reliable: false,
            wake,
            reply: None,
        })
    }

    /// Reliable send: stamps an `mId`, tracks the ACK, retries on timeout.
    /// Resolves with the assigned id (or `None` for legacy-firmware peers
    /// that fall back to fire-and-forget).
    pub async fn send_reliable(&self, msg: Value) -> Result<Option<u64>, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_cmd(LinkCommand::SendJson {
            msg,
            reliable: true,
            wake: false,
            reply: Some(reply_tx),
        })?;
        reply_rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Request a photo. With a webhook URL, the assembled image is POSTed
    /// there when the transfer completes.
    pub async fn take_photo(
        &self,
        request: TakePhoto,
        auth_token: Option<String>,
    ) -> Result<(), LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_cmd(LinkCommand::TakePhoto {
            request,
            auth_token,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    pub async fn set_mic_state(&self, enabled: bool) -> Result<Option<u64>, LinkError> {
        self.send_reliable(messages::set_mic_state(enabled)).await
    }

    /// Stream a binary blob to the device as chunked file packets.
    /// Resolves with the packet count once everything is queued.
    pub async fn send_file(
        &self,
        name: &str,
        data: Vec<u8>,
        cmd: CmdType,
    ) -> Result<u32, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_cmd(LinkCommand::SendFile {
            name: name.to_owned(),
            data,
            cmd,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Display text, waking the device out of low power first.
    pub fn display_text(&self, text: &str) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::SendJson {
            msg: messages::display_text(text),
            reliable: false,
            wake: true,
            reply: None,
        })
    }

    pub fn request_wifi_scan(&self) -> Result<(), LinkError> {
        self.send_json(messages::request_wifi_scan(), false)
    }

    pub fn send_wifi_credentials(&self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.send_json(messages::send_wifi_credentials(ssid, password), false)
    }

    pub fn keep_alive_ack(&self, stream_id: &str) -> Result<(), LinkError> {
        let ack = messages::KeepAliveAck {
            stream_id: stream_id.to_owned(),
            ack_id: None,
        };
        self.send_json(ack.to_message(), false)
    }

    /// Register (or replace) a handler for a message type.
    pub fn register_handler<H>(&self, msg_type: &str, handler: H) -> Result<(), LinkError>
    where
        H: CommandHandler + 'static,
    {
        self.send_cmd(LinkCommand::RegisterHandler {
            msg_type: msg_type.to_owned(),
            handler: Box::new(handler),
        })
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<LinkEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> PublicState {
        *self.public_rx.borrow()
    }

    /// Watch projection changes without polling.
    pub fn state_watch(&self) -> watch::Receiver<PublicState> {
        self.public_rx.clone()
    }

    /// Stop the link task entirely.
    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.send_cmd(LinkCommand::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

struct LinkTask {
    config: LinkConfig,
    transport: Arc<dyn BleTransport>,
    http: Arc<dyn HttpPoster>,
    prefs: Preferences,
    registry: PeerRegistry,
    bus: EventBus,
    mail_tx: mpsc::UnboundedSender<Mail>,
    public_tx: watch::Sender<PublicState>,

    state: ConnectionState,
    /// Bumped on every teardown; retires stale timers and driver results.
    epoch: u64,
    target_kind: Option<PeerKind>,
    target_address: Option<String>,
    peer_name: Option<String>,
    params: PeerParams,
    fw_build: Option<u32>,
    negotiated_mtu: Option<u16>,

    id_gen: MessageIdGenerator,
    tracker: AckTracker,
    dup_cache: DuplicateCache,
    reassembler: Reassembler,
    dispatcher: Dispatcher,
    photo_table: PhotoTransferTable,
    pipeline: Option<SendQueue>,
    prober: ReadinessProber,
    heartbeats: HeartbeatSchedule,
    reconnect_attempts: u32,
    reconnect_enabled: bool,
    decoder_errors: VecDeque<Instant>,
    scan_is_inventory: bool,
}

impl LinkTask {
    async fn run(mut self, mut mail_rx: mpsc::UnboundedReceiver<Mail>) {
        while let Some(mail) = mail_rx.recv().await {
            match mail {
                Mail::Cmd(LinkCommand::Shutdown) => {
                    self.teardown(false).await;
                    break;
                }
                Mail::Cmd(cmd) => self.handle_command(cmd).await,
                Mail::Transport(event) => self.handle_transport(event).await,
                Mail::Timer { epoch, kind } => {
                    if epoch == self.epoch {
                        self.handle_timer(kind).await;
                    }
                }
                Mail::BringUp { epoch, step } => {
                    if epoch == self.epoch {
                        self.handle_bring_up(step).await;
                    }
                }
                Mail::Pipeline(PipelineSignal::WriteFailed { error }) => {
                    warn!(%error, "send pipeline lost the link");
                    self.teardown(true).await;
                }
            }
        }
        debug!("link task stopped");
    }

    // -----------------------------------------------------------------------
    // State bookkeeping
    // -----------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = ?self.state, to = ?next, "connection state");
        let before = project(self.state);
        self.state = next;
        let after = project(next);
        if before != after {
            let _ = self.public_tx.send(after);
            self.bus.publish(LinkEvent::ConnectionStateChanged(after));
        }
    }

    fn schedule_timer(&self, delay: Duration, kind: TimerKind) {
        let tx = self.mail_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Mail::Timer { epoch, kind });
        });
    }

    fn reconnect_delay(&self) -> Duration {
        backoff_delay(
            self.config.base_reconnect_delay,
            self.config.max_reconnect_delay,
            self.reconnect_attempts,
        )
    }

    /// Tear down the current link. `schedule_reconnect` keeps the retry
    /// loop alive for transient failures; fatal paths pass false.
    async fn teardown(&mut self, schedule_reconnect: bool) {
        self.epoch += 1;

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.clear();
        }
        for m_id in self.tracker.clear() {
            self.bus.publish(LinkEvent::DeliveryFailed { m_id });
        }
        self.reassembler.clear();
        self.dup_cache.clear();
        self.photo_table.clear();
        self.decoder_errors.clear();
        self.negotiated_mtu = None;
        self.fw_build = None;

        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Scanning => {
                let _ = self.transport.scan_stop().await;
            }
            _ => {
                let _ = self.transport.disconnect().await;
            }
        }
        self.set_state(ConnectionState::Disconnected);

        if schedule_reconnect && self.reconnect_enabled {
            if self.reconnect_attempts >= self.config.max_reconnect_attempts {
                warn!(
                    attempts = self.reconnect_attempts,
                    "reconnect budget exhausted; waiting for owner"
                );
                return;
            }
            let delay = self.reconnect_delay();
            self.reconnect_attempts += 1;
            info!(attempt = self.reconnect_attempts, ?delay, "reconnect scheduled");
            self.schedule_timer(delay, TimerKind::Reconnect);
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: LinkCommand) {
        match cmd {
            LinkCommand::Connect { kind, address } => {
                // A connect on top of a live link first tears it down.
                if self.state != ConnectionState::Disconnected {
                    self.teardown(false).await;
                }
                self.reconnect_enabled = true;
                self.reconnect_attempts = 0;
                self.target_kind = Some(kind);
                self.params = PeerParams::for_kind(kind);

                let known = address.or_else(|| {
                    self.registry
                        .get(kind)
                        .ok()
                        .flatten()
                        .map(|identity| identity.address)
                });
                match known {
                    Some(addr) => {
                        self.target_address = Some(addr.clone());
                        self.start_connect(addr);
                    }
                    None => self.start_scan(false).await,
                }
            }
            LinkCommand::Disconnect => {
                self.reconnect_enabled = false;
                self.teardown(false).await;
            }
            LinkCommand::Forget => {
                if let Some(kind) = self.target_kind {
                    if let Err(e) = self.registry.forget(kind) {
                        warn!(error = %e, "forget failed to clear storage");
                    }
                }
                self.target_address = None;
                self.peer_name = None;
                self.reconnect_enabled = false;
                self.teardown(false).await;
            }
            LinkCommand::ScanInventory => {
                if self.state == ConnectionState::Disconnected {
                    self.start_scan(true).await;
                }
            }
            LinkCommand::ScanStop => {
                if self.state == ConnectionState::Scanning {
                    let _ = self.transport.scan_stop().await;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            LinkCommand::SendJson {
                msg,
                reliable,
                wake,
                reply,
            } => {
                let result = self.send_message(msg, reliable, wake);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            LinkCommand::TakePhoto {
                request,
                auth_token,
                reply,
            } => {
                let result = self.handle_take_photo(request, auth_token);
                let _ = reply.send(result);
            }
            LinkCommand::SendFile {
                name,
                data,
                cmd,
                reply,
            } => {
                let result = self.handle_send_file(&name, &data, cmd);
                let _ = reply.send(result);
            }
            LinkCommand::RegisterHandler { msg_type, handler } => {
                self.dispatcher.register_boxed(&msg_type, handler);
            }
            // Shutdown is intercepted in run(); nothing to do here.
            LinkCommand::Shutdown => {}
        }
    }

    async fn start_scan(&mut self, inventory: bool) {
        let prefix = self
            .target_kind
            .map(PeerKind::scan_name_prefix)
            .unwrap_or("Xy");
        self.scan_is_inventory = inventory;
        match self
            .transport
            .scan_start(ScanFilter {
                name_prefix: prefix.to_owned(),
            })
            .await
        {
            Ok(()) => {
                self.set_state(ConnectionState::Scanning);
                let timeout = if inventory {
                    self.config.scan_timeout_inventory
                } else {
                    self.config.scan_timeout_targeted
                };
                self.schedule_timer(timeout, TimerKind::ScanTimeout);
            }
            Err(TransportError::Unavailable(reason)) => {
                warn!(%reason, "transport unavailable; reconnect loop paused");
                self.reconnect_enabled = false;
                self.set_state(ConnectionState::Disconnected);
            }
            Err(e) => {
                warn!(error = %e, "scan failed to start");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn start_connect(&mut self, address: String) {
        self.set_state(ConnectionState::Connecting);
        let transport = self.transport.clone();
        let tx = self.mail_tx.clone();
        let epoch = self.epoch;
        let mtu_target = self.params.mtu_target;

        tokio::spawn(async move {
            let send = |step: BringUpStep| {
                let _ = tx.send(Mail::BringUp { epoch, step });
            };

            match tokio::time::timeout(CONNECT_TIMEOUT, transport.connect(&address)).await {
                Ok(Ok(())) => send(BringUpStep::LinkUp),
                Ok(Err(error)) => {
                    send(BringUpStep::Failed {
                        stage: "connect",
                        error,
                    });
                    return;
                }
                Err(_) => {
                    send(BringUpStep::Failed {
                        stage: "connect",
                        error: TransportError::ConnectFailed("timed out".to_owned()),
                    });
                    return;
                }
            }

            // MTU is requested once per link-up; one retry below the floor,
            // and any outcome advances bring-up.
            let negotiated = match transport.request_mtu(mtu_target).await {
                Ok(mtu) if mtu < MTU_FLOOR => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    transport.request_mtu(mtu_target).await.unwrap_or(mtu)
                }
                Ok(mtu) => mtu,
                Err(error) => {
                    debug!(%error, "MTU request failed; continuing at default");
                    23
                }
            };
            send(BringUpStep::Mtu { negotiated });

            match transport.discover_services().await {
                Ok(characteristics) => {
                    let ok = characteristics.iter().any(|c| c == LINK_TX_CHAR_UUID)
                        && characteristics.iter().any(|c| c == LINK_RX_CHAR_UUID);
                    send(BringUpStep::Services { ok });
                    if !ok {
                        return;
                    }
                }
                Err(error) => {
                    send(BringUpStep::Failed {
                        stage: "discover",
                        error,
                    });
                    return;
                }
            }

            match transport.enable_notifications(LINK_RX_CHAR_UUID).await {
                Ok(()) => send(BringUpStep::NotificationsReady),
                Err(error) => send(BringUpStep::Failed {
                    stage: "subscribe",
                    error,
                }),
            }
        });
    }

    async fn handle_bring_up(&mut self, step: BringUpStep) {
        match step {
            BringUpStep::LinkUp => self.set_state(ConnectionState::LinkEstablished),
            BringUpStep::Mtu { negotiated } => {
                debug!(negotiated, "MTU settled");
                self.negotiated_mtu = Some(negotiated);
            }
            BringUpStep::Services { ok: true } => {
                self.set_state(ConnectionState::ServicesResolved);
            }
            BringUpStep::Services { ok: false } => {
                // Fatal for this peer identity: no reconnect until the
                // owner intervenes.
                warn!("required characteristics missing on peer");
                self.reconnect_enabled = false;
                self.teardown(false).await;
            }
            BringUpStep::NotificationsReady => {
                self.set_state(ConnectionState::NotificationsReady);
                self.pipeline = Some(send_pipeline::spawn(
                    self.transport.clone(),
                    PipelineSettings {
                        min_send_interval: self.config.min_send_interval,
                        queue_cap: self
                            .params
                            .constrained_queue
                            .then_some(self.config.command_queue_max),
                        characteristic: LINK_TX_CHAR_UUID.to_owned(),
                    },
                    self.pipeline_signal_sender(),
                    self.bus.clone(),
                ));
                self.set_state(ConnectionState::AwaitingDeviceReady);
                self.prober = ReadinessProber::new(self.config.readiness_max_probes);
                self.heartbeats = HeartbeatSchedule::new(self.config.battery_every_n_heartbeats);
                self.fire_readiness_probe().await;
            }
            BringUpStep::Failed { stage, error } => {
                warn!(stage, %error, "bring-up failed");
                self.teardown(true).await;
            }
        }
    }

    fn pipeline_signal_sender(&self) -> mpsc::UnboundedSender<PipelineSignal> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mail = self.mail_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if mail.send(Mail::Pipeline(signal)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanTimeout => {
                if self.state == ConnectionState::Scanning {
                    let _ = self.transport.scan_stop().await;
                    info!(inventory = self.scan_is_inventory, "scan window closed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TimerKind::AckCheck { m_id } => match self.tracker.on_ack_timeout(m_id) {
                RetryDecision::Resend(bytes) => {
                    debug!(m_id, retry = ?self.tracker.retries_of(m_id), "ACK timeout; resending");
                    self.enqueue_bytes(bytes);
                    self.schedule_timer(self.config.ack_timeout, TimerKind::AckCheck { m_id });
                }
                RetryDecision::Exhausted => {
                    warn!(m_id, "delivery failed; retries exhausted");
                    self.bus.publish(LinkEvent::DeliveryFailed { m_id });
                }
                RetryDecision::Settled => {}
            },
            TimerKind::ReadinessProbe => {
                if self.state == ConnectionState::AwaitingDeviceReady {
                    self.fire_readiness_probe().await;
                }
            }
            TimerKind::Heartbeat => {
                if self.state == ConnectionState::Connected {
                    let tick = self.heartbeats.tick();
                    self.send_fire_and_forget(messages::ping(), false);
                    if tick.poll_battery {
                        self.send_battery_poll();
                    }
                    self.schedule_timer(self.config.heartbeat_interval, TimerKind::Heartbeat);
                }
            }
            TimerKind::Reconnect => {
                if self.state == ConnectionState::Disconnected && self.reconnect_enabled {
                    match self.target_address.clone() {
                        Some(address) => self.start_connect(address),
                        None => self.start_scan(false).await,
                    }
                }
            }
            TimerKind::SessionSweep => {
                for abandoned in self.reassembler.sweep_expired(Instant::now()) {
                    self.bus.publish(LinkEvent::SessionAbandoned {
                        name: abandoned.name,
                        received: abandoned.received,
                        total: abandoned.total,
                    });
                }
                if self.state == ConnectionState::Connected {
                    self.schedule_timer(self.sweep_interval(), TimerKind::SessionSweep);
                }
            }
            TimerKind::PendingCleanup => {
                // Photo requests the device never serviced are dropped so
                // the table cannot grow across a long session.
                let cutoff = self.config.pending_cleanup_interval;
                let stale: Vec<String> = self
                    .photo_table
                    .iter()
                    .filter(|t| {
                        t.transfer_started_at.is_none() && t.requested_at.elapsed() >= cutoff
                    })
                    .map(|t| t.ble_img_id.clone())
                    .collect();
                for id in stale {
                    warn!(ble_img_id = %id, "dropping unserviced photo request");
                    self.photo_table.take(&id);
                }
                if self.state == ConnectionState::Connected {
                    self.schedule_timer(
                        self.config.pending_cleanup_interval,
                        TimerKind::PendingCleanup,
                    );
                }
            }
        }
    }

    fn sweep_interval(&self) -> Duration {
        (self.config.session_inactivity_timeout / 2).max(Duration::from_secs(1))
    }

    async fn fire_readiness_probe(&mut self) {
        match self.prober.next_step() {
            ProbeStep::SendProbe => {
                let probe = if self.params.use_c_wrap {
                    system::heartbeat_probe()
                } else {
                    serde_json::json!({"type": "phone_ready"})
                };
                self.send_fire_and_forget(probe, false);
                self.schedule_timer(
                    self.config.readiness_probe_interval,
                    TimerKind::ReadinessProbe,
                );
            }
            ProbeStep::GiveUp => {
                let probes = self.prober.probes_sent();
                warn!(probes, "device never reported ready");
                self.bus.publish(LinkEvent::ReadinessFailed { probes });
                self.teardown(true).await;
            }
        }
    }

    fn send_battery_poll(&mut self) {
        if self.params.use_c_wrap {
            self.send_fire_and_forget(system::battery_probe(), false);
        } else {
            self.send_fire_and_forget(messages::request_battery_state(), false);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn peer_supports_acks(&self) -> bool {
        self.fw_build
            .is_none_or(|build| build >= self.config.ack_firmware_min_build)
    }

    fn encode_outbound(&self, msg: &Value, wake: bool) -> Result<Vec<u8>, LinkError> {
        let result = if self.params.use_c_wrap {
            encode_json(msg, wake, Direction::HostToDevice)
        } else {
            let bytes = serde_json::to_vec(msg)
                .map_err(|e| CodecError::InvalidLength(e.to_string()))?;
            k900_core::encode_raw(&bytes, CmdType::String, Direction::HostToDevice)
        };
        result.map_err(|e| match e {
            CodecError::OversizedPayload(size) => LinkError::OversizedPayload(size),
            other => LinkError::Decoder(other),
        })
    }

    fn enqueue_bytes(&mut self, bytes: Vec<u8>) -> bool {
        match &self.pipeline {
            Some(pipeline) => pipeline.enqueue(bytes),
            None => false,
        }
    }

    fn send_fire_and_forget(&mut self, msg: Value, wake: bool) {
        match self.encode_outbound(&msg, wake) {
            Ok(bytes) => {
                self.enqueue_bytes(bytes);
            }
            Err(e) => warn!(error = %e, "failed to encode outbound message"),
        }
    }

    /// The outbound path behind `send_json`/`send_reliable`.
    fn send_message(
        &mut self,
        mut msg: Value,
        reliable: bool,
        wake: bool,
    ) -> Result<Option<u64>, LinkError> {
        if self.pipeline.is_none() {
            return Err(LinkError::NotConnected);
        }

        // Only objects can carry an mId; anything else (system command
        // strings) goes out as-is.
        let m_id = if reliable && msg.is_object() && self.peer_supports_acks() {
            let id = self.id_gen.next_id();
            msg[gl_protocol::MSG_ID_FIELD] = Value::from(id);
            Some(id)
        } else {
            None
        };

        // Encode before tracking: an oversized payload must leave the
        // queue and the pending table untouched.
        let bytes = self.encode_outbound(&msg, wake)?;

        if let Some(id) = m_id {
            self.tracker.track(id, bytes.clone());
            self.schedule_timer(self.config.ack_timeout, TimerKind::AckCheck { m_id: id });
        }
        if !self.enqueue_bytes(bytes) {
            if let Some(id) = m_id {
                self.tracker.acknowledge(id);
            }
            return Err(LinkError::NotConnected);
        }
        Ok(m_id)
    }

    fn handle_send_file(&mut self, name: &str, data: &[u8], cmd: CmdType) -> Result<u32, LinkError> {
        let Some(queue) = &self.pipeline else {
            return Err(LinkError::NotConnected);
        };
        let pack_size =
            file_sender::effective_pack_size(self.params.file_pack_size, self.negotiated_mtu);
        file_sender::queue_file(queue, name, data, pack_size, cmd)
    }

    fn handle_take_photo(
        &mut self,
        request: TakePhoto,
        auth_token: Option<String>,
    ) -> Result<(), LinkError> {
        if let Some(webhook_url) = request.webhook_url.clone() {
            // No caller-supplied token falls back to the stored preference.
            let auth_token = match auth_token {
                Some(token) => Some(token),
                None => self.prefs.auth_token().unwrap_or_default(),
            };
            self.photo_table.open(BlePhotoTransfer {
                ble_img_id: request.ble_img_id.clone(),
                request_id: request.request_id.clone(),
                webhook_url,
                auth_token,
                requested_at: Instant::now(),
                transfer_started_at: None,
                compression_ms: None,
            });
        }
        self.send_message(request.to_message(), true, false)
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered { name, address } => {
                if self.state != ConnectionState::Scanning {
                    return;
                }
                if self.scan_is_inventory {
                    self.bus.publish(LinkEvent::PeerDiscovered { name, address });
                } else {
                    info!(%name, %address, "targeted scan matched");
                    let _ = self.transport.scan_stop().await;
                    self.peer_name = Some(name);
                    self.target_address = Some(address.clone());
                    self.start_connect(address);
                }
            }
            TransportEvent::Notification {
                characteristic,
                data,
            } => {
                if characteristic == LINK_RX_CHAR_UUID {
                    self.handle_inbound(&data).await;
                } else {
                    debug!(%characteristic, "notification on unexpected characteristic");
                }
            }
            TransportEvent::LinkDown { reason } => {
                if self.state == ConnectionState::Disconnected {
                    return;
                }
                warn!(%reason, "link down");
                self.teardown(true).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound pipeline
    // -----------------------------------------------------------------------

    async fn handle_inbound(&mut self, data: &[u8]) {
        match decode_inbound(data) {
            Ok(Inbound::File(packet)) => self.handle_file_packet(packet),
            Ok(Inbound::Json(value)) => self.handle_inbound_json(value).await,
            Ok(Inbound::Raw { cmd, payload }) => match cmd {
                CmdType::Audio => self.bus.publish(LinkEvent::MicAudioChunk { data: payload }),
                other => {
                    debug!(cmd = ?other, len = payload.len(), "unroutable generic frame dropped");
                }
            },
            Err(error) => self.note_decoder_error(error).await,
        }
    }

    async fn note_decoder_error(&mut self, error: CodecError) {
        debug!(%error, "dropping undecodable packet");
        let now = Instant::now();
        self.decoder_errors.push_back(now);
        let window = self.config.decoder_error_window;
        while let Some(front) = self.decoder_errors.front() {
            if now.duration_since(*front) > window {
                self.decoder_errors.pop_front();
            } else {
                break;
            }
        }
        if self.state == ConnectionState::Connected
            && self.decoder_errors.len() as u32 >= self.config.decoder_error_threshold
        {
            warn!(
                errors = self.decoder_errors.len(),
                "decode failure burst; treating link as corrupted"
            );
            self.teardown(true).await;
        }
    }

    fn handle_file_packet(&mut self, packet: FilePacket) {
        match self.reassembler.ingest(packet) {
            IngestOutcome::Started { name, total } => {
                debug!(%name, total, "file transfer started");
            }
            IngestOutcome::Appended { name, received, total } => {
                debug!(%name, received, total, "file chunk placed");
            }
            IngestOutcome::Complete { name, kind: cmd, data, elapsed } => {
                info!(%name, bytes = data.len(), ?elapsed, "file transfer complete");
                if cmd == CmdType::Photo {
                    if let Some(transfer) = self.photo_table.take(&name) {
                        tokio::spawn(upload_photo(
                            self.http.clone(),
                            transfer,
                            data,
                            self.bus.clone(),
                        ));
                        return;
                    }
                }
                self.bus.publish(LinkEvent::FileReceived {
                    name,
                    kind: file_kind(cmd),
                    data,
                });
            }
            IngestOutcome::DuplicateIgnored { name, index } => {
                debug!(%name, index, "duplicate file chunk ignored");
            }
            IngestOutcome::OutOfRangeRejected { name, index } => {
                warn!(%name, index, "file chunk index out of range");
            }
            IngestOutcome::SizeMismatch { name, expected, actual } => {
                warn!(%name, expected, actual, "assembled size mismatch; transfer dropped");
            }
        }
    }

    async fn handle_inbound_json(&mut self, value: Value) {
        // System commands ride the envelope with a string `C`; everything
        // else unwraps to a plain JSON message.
        if let Ok(envelope) = serde_json::from_value::<Envelope>(value.clone()) {
            if envelope.is_system_command() {
                if let Some(msg) = SystemMessage::from_envelope(&envelope) {
                    self.handle_system(msg).await;
                }
                return;
            }
        }
        let msg = unwrap_envelope(value);
        self.dispatch_message(msg).await;
    }

    async fn handle_system(&mut self, msg: SystemMessage) {
        match msg {
            SystemMessage::Heartbeat(body) => {
                self.bus.publish(LinkEvent::BatteryChanged {
                    level: body.pt,
                    charging: body.charg == 1,
                });
                if self.state == ConnectionState::AwaitingDeviceReady
                    && body.ready == 0
                    && body.pt <= self.config.pairing_battery_floor
                {
                    warn!(level = body.pt, "peer battery too low to finish pairing");
                    self.bus
                        .publish(LinkEvent::PairingBatteryTooLow { level: body.pt });
                    self.reconnect_enabled = false;
                    self.teardown(false).await;
                }
            }
            SystemMessage::Battery(body) => {
                self.bus.publish(LinkEvent::BatteryVoltage {
                    millivolts: body.vt,
                    level: body.pt,
                });
                self.bus.publish(LinkEvent::BatteryChanged {
                    level: body.pt,
                    charging: false,
                });
            }
            SystemMessage::Shutdown => {
                info!("device announced shutdown; disconnecting without reconnect");
                self.reconnect_enabled = false;
                self.teardown(false).await;
            }
            SystemMessage::Unknown { command, .. } => {
                debug!(%command, "unhandled system command");
            }
        }
    }

    async fn dispatch_message(&mut self, msg: Value) {
        let Some(msg_type) = msg.get("type").and_then(Value::as_str).map(str::to_owned) else {
            debug!("inbound JSON without a type field dropped");
            return;
        };

        // ACKs settle pending sends before anything else happens.
        if msg_type == gl_protocol::TYPE_MSG_ACK {
            match serde_json::from_value::<MsgAck>(msg.clone()) {
                Ok(ack) => {
                    if self.tracker.acknowledge(ack.m_id).is_none() {
                        debug!(m_id = ack.m_id, "unmatched ACK ignored");
                    }
                }
                Err(e) => debug!(error = %e, "malformed msg_ack"),
            }
            return;
        }

        // Duplicate suppression: ACK again, dispatch once.
        let m_id = msg.get(gl_protocol::MSG_ID_FIELD).and_then(Value::as_u64);
        if let Some(id) = m_id {
            let duplicate = self.dup_cache.check_and_insert(id, Instant::now());
            self.send_fire_and_forget(MsgAck { m_id: id }.to_message(), false);
            if duplicate {
                debug!(m_id = id, "duplicate message suppressed");
                return;
            }
        }

        // State-coupled messages get their side effects before dispatch.
        match msg_type.as_str() {
            t if t == gl_protocol::TYPE_GLASSES_READY => self.on_glasses_ready(),
            "version_info" => {
                if let Ok(info) = serde_json::from_value::<VersionInfo>(msg.clone()) {
                    if let Some(build) = info.build_number {
                        debug!(build, "peer firmware build recorded");
                        self.fw_build = Some(build);
                    }
                }
            }
            "ble_photo_ready" => {
                if let Ok(ready) = serde_json::from_value::<BlePhotoReady>(msg.clone()) {
                    if !self
                        .photo_table
                        .mark_ready(&ready.ble_img_id, ready.compression_duration_ms)
                    {
                        debug!(ble_img_id = %ready.ble_img_id, "photo ready without a pending request");
                    }
                }
            }
            _ => {}
        }

        self.dispatcher.dispatch(&msg_type, &msg);
    }

    fn on_glasses_ready(&mut self) {
        if self.state != ConnectionState::AwaitingDeviceReady {
            debug!(state = ?self.state, "glasses_ready outside bring-up ignored");
            return;
        }
        info!("device ready; link fully up");
        self.set_state(ConnectionState::Connected);
        self.reconnect_attempts = 0;

        if let (Some(kind), Some(address)) = (self.target_kind, self.target_address.clone()) {
            let identity = PeerIdentity {
                kind,
                address,
                name: self.peer_name.clone().unwrap_or_default(),
            };
            if let Err(e) = self.registry.put(&identity) {
                warn!(error = %e, "failed to persist peer identity");
            }
            if let Some(name) = &self.peer_name {
                if let Err(e) = self.prefs.set_last_peer_name(kind, name) {
                    warn!(error = %e, "failed to persist peer name preference");
                }
            }
        }

        self.schedule_timer(self.config.heartbeat_interval, TimerKind::Heartbeat);
        self.schedule_timer(self.sweep_interval(), TimerKind::SessionSweep);
        self.schedule_timer(
            self.config.pending_cleanup_interval,
            TimerKind::PendingCleanup,
        );
    }
}

// ---------------------------------------------------------------------------
// Inbound decoding
// ---------------------------------------------------------------------------

enum Inbound {
    File(FilePacket),
    Json(Value),
    /// Structurally valid non-JSON generic frame (mic audio, raw data).
    Raw { cmd: CmdType, payload: Vec<u8> },
}

/// Split an inbound notification into its two shapes.
///
/// The type byte disambiguates: `String` frames carry JSON; file-bearing
/// types are tried as file packets first, falling back to a generic frame
/// for streams (audio) that use the plain framing.
fn decode_inbound(data: &[u8]) -> Result<Inbound, CodecError> {
    if data.len() < 3 || data[0..2] != k900_core::START_MARKER {
        return Err(CodecError::NotAFrame);
    }
    let cmd = CmdType::from_byte(data[2]).ok_or(CodecError::UnknownCommandType(data[2]))?;

    if cmd.is_file_bearing() {
        match k900_core::decode_file_packet(data) {
            Ok(packet) => return Ok(Inbound::File(packet)),
            Err(CodecError::ChecksumMismatch { computed, carried }) => {
                return Err(CodecError::ChecksumMismatch { computed, carried });
            }
            // Not shaped like a file packet; fall through to generic.
            Err(_) => {}
        }
    }

    let frame = k900_core::decode_frame(data, Direction::DeviceToHost)?;
    match frame.cmd {
        CmdType::String => {
            let value: Value = serde_json::from_slice(&frame.payload)
                .map_err(|e| CodecError::InvalidLength(format!("JSON parse: {e}")))?;
            Ok(Inbound::Json(value))
        }
        cmd => Ok(Inbound::Raw {
            cmd,
            payload: frame.payload,
        }),
    }
}

/// Exponential backoff: `base · 2^attempts`, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exp = attempts.min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

fn file_kind(cmd: CmdType) -> FileKind {
    match cmd {
        CmdType::Photo => FileKind::Photo,
        CmdType::Video => FileKind::Video,
        CmdType::Audio => FileKind::Audio,
        CmdType::Music => FileKind::Music,
        CmdType::String | CmdType::Data => FileKind::Data,
    }
}

// ---------------------------------------------------------------------------
// Unit tests (pure helpers; behavior is covered by the e2e suites)
// ---------------------------------------------------------------------------
