//! Reliable messaging: message identity, ACK tracking, duplicate suppression.
//!
//! Outgoing reliable messages are stamped with a 64-bit `mId`, remembered
//! until the peer echoes it in a `msg_ack`, and resent on a timer up to the
//! retry cap. Inbound `mId`s are remembered for the duplicate window so a
//! re-received message is acknowledged again without re-dispatching.
//!
//! Peers on firmware builds older than the threshold never see `mId`s;
//! messaging to them is fire-and-forget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;

// ---------------------------------------------------------------------------
// Message identity
// ---------------------------------------------------------------------------

/// Generates per-message identifiers.
///
/// Mixes wall-clock millis, a process-scoped random device id, a fresh
/// random word, and a monotonic counter shifted high. The exact recipe is
/// not load-bearing; what matters is negligible collision probability over
/// a device's lifetime and unpredictability to an observer. The result is
/// forced positive so it survives transports that treat ids as signed.
#[derive(Debug)]
pub struct MessageIdGenerator {
    device_id: u64,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> MessageIdGenerator {
        MessageIdGenerator {
            device_id: rand::thread_rng().next_u64(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mixed =
            millis ^ self.device_id ^ rand::thread_rng().next_u64() ^ (count << 32);
        // unsigned_abs is total on i64::MIN; the mask keeps the result in
        // positive-i64 range for peers that parse ids as signed.
        (mixed as i64).unsigned_abs() & (i64::MAX as u64)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        MessageIdGenerator::new()
    }
}

// ---------------------------------------------------------------------------
// Pending-ACK table
// ---------------------------------------------------------------------------

/// One tracked reliable message.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub m_id: u64,
    /// The exact serialized bytes first transmitted; retries resend these.
    pub wire_bytes: Vec<u8>,
    pub first_sent: Instant,
    pub retries: u32,
}

/// Outcome of an ACK-check timer firing for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend these bytes and schedule another check.
    Resend(Vec<u8>),
    /// Retry cap hit; entry removed, delivery failed.
    Exhausted,
    /// ACK arrived (or the table was cleared) before the timer fired.
    Settled,
}

/// The pending-ACK table. All access happens on the link task.
#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<u64, PendingAck>,
    max_retries: u32,
}

impl AckTracker {
    pub fn new(max_retries: u32) -> AckTracker {
        AckTracker {
            pending: HashMap::new(),
            max_retries,
        }
    }

    /// Track a freshly transmitted message.
    pub fn track(&mut self, m_id: u64, wire_bytes: Vec<u8>) {
        self.pending.insert(
            m_id,
            PendingAck {
                m_id,
                wire_bytes,
                first_sent: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Handle an inbound ACK. Returns the settled entry, or `None` for an
    /// unmatched ACK (logged and ignored by the caller).
    pub fn acknowledge(&mut self, m_id: u64) -> Option<PendingAck> {
        self.pending.remove(&m_id)
    }

    /// Handle an ACK-check timer firing for `m_id`.
    pub fn on_ack_timeout(&mut self, m_id: u64) -> RetryDecision {
        let Some(entry) = self.pending.get_mut(&m_id) else {
            return RetryDecision::Settled;
        };
        if entry.retries >= self.max_retries {
            self.pending.remove(&m_id);
            return RetryDecision::Exhausted;
        }
        entry.retries += 1;
        RetryDecision::Resend(entry.wire_bytes.clone())
    }

    pub fn retries_of(&self, m_id: u64) -> Option<u32> {
        self.pending.get(&m_id).map(|e| e.retries)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every entry (disconnect). Returns the abandoned ids so the
    /// caller can surface delivery failures; leaking tracked messages
    /// across link sessions is how stale retries haunt the next session.
    pub fn clear(&mut self) -> Vec<u64> {
        let ids = self.pending.keys().copied().collect();
        self.pending.clear();
        ids
    }
}

// ---------------------------------------------------------------------------
// Duplicate suppression
// ---------------------------------------------------------------------------

/// Time-bounded cache of inbound message ids.
///
/// Any id seen within the window is a duplicate regardless of payload.
/// Stale entries are pruned opportunistically on each probe, which bounds
/// the cache at ingress-rate × window.
#[derive(Debug)]
pub struct DuplicateCache {
    seen: HashMap<u64, Instant>,
    window: Duration,
}

impl DuplicateCache {
    pub fn new(window: Duration) -> DuplicateCache {
        DuplicateCache {
            seen: HashMap::new(),
            window,
        }
    }

    /// Record `m_id` at `now`; returns true when it is a duplicate.
    pub fn check_and_insert(&mut self, m_id: u64, now: Instant) -> bool {
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        match self.seen.get(&m_id) {
            Some(_) => true,
            None => {
                self.seen.insert(m_id, now);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
