//! Readiness probing and post-ready heartbeat cadence.
//!
//! Bring-up sends a `cs_hrt` system probe every probe interval until the
//! device answers `glasses_ready` (or the probe budget runs out). Once
//! connected, a `ping` goes out every heartbeat interval, with a battery
//! poll piggybacked on every Nth beat. The structs here are pure
//! bookkeeping; the link task owns the timers and the sends.

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Counts readiness probes during bring-up.
#[derive(Debug)]
pub struct ReadinessProber {
    sent: u32,
    max_probes: u32,
}

/// What to do when the probe timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    /// Send another `cs_hrt` and reschedule.
    SendProbe,
    /// Probe budget exhausted; bring-up failed.
    GiveUp,
}

impl ReadinessProber {
    pub fn new(max_probes: u32) -> ReadinessProber {
        ReadinessProber { sent: 0, max_probes }
    }

    pub fn next_step(&mut self) -> ProbeStep {
        if self.sent >= self.max_probes {
            return ProbeStep::GiveUp;
        }
        self.sent += 1;
        ProbeStep::SendProbe
    }

    pub fn probes_sent(&self) -> u32 {
        self.sent
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Tracks the post-ready ping cadence and the battery-poll batching.
#[derive(Debug)]
pub struct HeartbeatSchedule {
    beats: u64,
    battery_every_n: u32,
}

/// What one heartbeat tick should send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Always true — every tick pings.
    pub send_ping: bool,
    /// True on every Nth tick.
    pub poll_battery: bool,
}

impl HeartbeatSchedule {
    pub fn new(battery_every_n: u32) -> HeartbeatSchedule {
        HeartbeatSchedule {
            beats: 0,
            battery_every_n: battery_every_n.max(1),
        }
    }

    pub fn tick(&mut self) -> HeartbeatTick {
        self.beats += 1;
        HeartbeatTick {
            send_ping: true,
            poll_battery: self.beats % u64::from(self.battery_every_n) == 0,
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
