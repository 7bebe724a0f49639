//! Link configuration.
//!
//! Every knob has a default; embedders usually construct
//! `LinkConfig::default()` and override a field or two. A TOML loader is
//! provided for hosts that keep link tuning in a config file — raw
//! deserialization structs with optional fields, validated and filled
//! with defaults, durations expressed in milliseconds.

use serde::Deserialize;
use std::time::Duration;

// ---------------------------------------------------------------------------
// LinkConfig
// ---------------------------------------------------------------------------

/// Tuning for one link instance.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Minimum wall-clock gap between consecutive transport writes.
    pub min_send_interval: Duration,
    /// How long to wait for an ACK before a retry.
    pub ack_timeout: Duration,
    /// Retries per reliable message before surfacing delivery failure.
    pub max_retries: u32,
    /// Post-readiness ping cadence.
    pub heartbeat_interval: Duration,
    /// Battery poll piggybacks on every Nth heartbeat.
    pub battery_every_n_heartbeats: u32,
    /// Readiness probe cadence during bring-up.
    pub readiness_probe_interval: Duration,
    /// Probes sent before giving up on readiness.
    pub readiness_max_probes: u32,
    /// Inventory scans stop after this long.
    pub scan_timeout_inventory: Duration,
    /// Targeted scans stop after this long.
    pub scan_timeout_targeted: Duration,
    /// First reconnect delay; doubles per attempt.
    pub base_reconnect_delay: Duration,
    /// Reconnect delay ceiling.
    pub max_reconnect_delay: Duration,
    /// Reconnect attempts before requiring owner intervention.
    pub max_reconnect_attempts: u32,
    /// MTU to request at link-up.
    pub mtu_target: u16,
    /// Chunk size for outbound file transfers.
    pub file_pack_size: u16,
    /// Window during which a repeated inbound mId is a duplicate.
    pub duplicate_window: Duration,
    /// Queue cap for constrained peers (oldest dropped beyond this).
    pub command_queue_max: usize,
    /// Sweep cadence for stale pending state (sessions, caches).
    pub pending_cleanup_interval: Duration,
    /// File-transfer sessions idle this long are abandoned.
    pub session_inactivity_timeout: Duration,
    /// Decode failures within [`Self::decoder_error_window`] that force a
    /// disconnect on a connected link.
    pub decoder_error_threshold: u32,
    pub decoder_error_window: Duration,
    /// Battery floor below which an un-ready peer aborts pairing.
    pub pairing_battery_floor: u8,
    /// Firmware builds below this use fire-and-forget messaging.
    pub ack_firmware_min_build: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            min_send_interval: Duration::from_millis(160),
            ack_timeout: Duration::from_secs(2),
            max_retries: 3,
            heartbeat_interval: Duration::from_secs(30),
            battery_every_n_heartbeats: 10,
            readiness_probe_interval: Duration::from_millis(2500),
            readiness_max_probes: 20,
            scan_timeout_inventory: Duration::from_secs(60),
            scan_timeout_targeted: Duration::from_secs(10),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            mtu_target: 512,
            file_pack_size: 400,
            duplicate_window: Duration::from_secs(10),
            command_queue_max: 3,
            pending_cleanup_interval: Duration::from_secs(300),
            session_inactivity_timeout: Duration::from_secs(60),
            decoder_error_threshold: 25,
            decoder_error_window: Duration::from_secs(10),
            pairing_battery_floor: 20,
            ack_firmware_min_build: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization (Option fields, ms-denominated durations)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawLinkConfig {
    min_send_interval_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    heartbeat_interval_ms: Option<u64>,
    battery_every_n_heartbeats: Option<u32>,
    readiness_probe_interval_ms: Option<u64>,
    readiness_max_probes: Option<u32>,
    scan_timeout_inventory_ms: Option<u64>,
    scan_timeout_targeted_ms: Option<u64>,
    base_reconnect_delay_ms: Option<u64>,
    max_reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    mtu_target: Option<u16>,
    file_pack_size: Option<u16>,
    duplicate_window_ms: Option<u64>,
    command_queue_max: Option<usize>,
    pending_cleanup_interval_ms: Option<u64>,
    session_inactivity_timeout_ms: Option<u64>,
    decoder_error_threshold: Option<u32>,
    decoder_error_window_ms: Option<u64>,
    pairing_battery_floor: Option<u8>,
    ack_firmware_min_build: Option<u32>,
}

/// Load link config from a TOML string, filling defaults per field.
pub fn load_config_from_str(toml_str: &str) -> Result<LinkConfig, ConfigError> {
    let raw: RawLinkConfig =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let d = LinkConfig::default();

    let ms = Duration::from_millis;
    let cfg = LinkConfig {
        min_send_interval: raw.min_send_interval_ms.map_or(d.min_send_interval, ms),
        ack_timeout: raw.ack_timeout_ms.map_or(d.ack_timeout, ms),
        max_retries: raw.max_retries.unwrap_or(d.max_retries),
        heartbeat_interval: raw.heartbeat_interval_ms.map_or(d.heartbeat_interval, ms),
        battery_every_n_heartbeats: raw
            .battery_every_n_heartbeats
            .unwrap_or(d.battery_every_n_heartbeats),
        readiness_probe_interval: raw
            .readiness_probe_interval_ms
            .map_or(d.readiness_probe_interval, ms),
        readiness_max_probes: raw.readiness_max_probes.unwrap_or(d.readiness_max_probes),
        scan_timeout_inventory: raw
            .scan_timeout_inventory_ms
            .map_or(d.scan_timeout_inventory, ms),
        scan_timeout_targeted: raw
            .scan_timeout_targeted_ms
            .map_or(d.scan_timeout_targeted, ms),
        base_reconnect_delay: raw
            .base_reconnect_delay_ms
            .map_or(d.base_reconnect_delay, ms),
        max_reconnect_delay: raw.max_reconnect_delay_ms.map_or(d.max_reconnect_delay, ms),
        max_reconnect_attempts: raw
            .max_reconnect_attempts
            .unwrap_or(d.max_reconnect_attempts),
        mtu_target: raw.mtu_target.unwrap_or(d.mtu_target),
        file_pack_size: raw.file_pack_size.unwrap_or(d.file_pack_size),
        duplicate_window: raw.duplicate_window_ms.map_or(d.duplicate_window, ms),
        command_queue_max: raw.command_queue_max.unwrap_or(d.command_queue_max),
        pending_cleanup_interval: raw
            .pending_cleanup_interval_ms
            .map_or(d.pending_cleanup_interval, ms),
        session_inactivity_timeout: raw
            .session_inactivity_timeout_ms
            .map_or(d.session_inactivity_timeout, ms),
        decoder_error_threshold: raw
            .decoder_error_threshold
            .unwrap_or(d.decoder_error_threshold),
        decoder_error_window: raw
            .decoder_error_window_ms
            .map_or(d.decoder_error_window, ms),
        pairing_battery_floor: raw.pairing_battery_floor.unwrap_or(d.pairing_battery_floor),
        ack_firmware_min_build: raw
            .ack_firmware_min_build
            .unwrap_or(d.ack_firmware_min_build),
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &LinkConfig) -> Result<(), ConfigError> {
    if cfg.file_pack_size == 0 {
        return Err(ConfigError::InvalidValue(
            "file_pack_size must be nonzero".to_owned(),
        ));
    }
    if cfg.command_queue_max == 0 {
        return Err(ConfigError::InvalidValue(
            "command_queue_max must be nonzero".to_owned(),
        ));
    }
    if cfg.pairing_battery_floor > 100 {
        return Err(ConfigError::InvalidValue(
            "pairing_battery_floor must be 0-100".to_owned(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
