//! File-transfer reassembly.
//!
//! The transport below the link retransmits lost packets on its own, so
//! this layer only has to place chunks: sessions are keyed by file name
//! (name minus extension for BLE photos, whose id is the stem), chunks by
//! pack index. Duplicates are ignored, out-of-range indices rejected, and
//! a session is complete exactly when every index has arrived. Idle
//! sessions are swept and reported abandoned rather than left to leak.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use k900_core::{CmdType, FilePacket};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What one ingested packet did to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First packet of a new session.
    Started { name: String, total: u32 },
    /// A fresh chunk landed; `received` of `total` now present.
    Appended { name: String, received: u32, total: u32 },
    /// Final chunk landed; `data` is the assembled blob, in index order.
    Complete {
        name: String,
        kind: CmdType,
        data: Vec<u8>,
        elapsed: Duration,
    },
    /// This index was already present; nothing changed.
    DuplicateIgnored { name: String, index: u16 },
    /// Index outside the session's packet count; packet dropped.
    OutOfRangeRejected { name: String, index: u16 },
    /// Chunk sizes disagreed with the declared file size; session dropped.
    SizeMismatch { name: String, expected: u32, actual: usize },
}

/// An idle session swept out by [`Reassembler::sweep_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedSession {
    pub name: String,
    pub received: u32,
    pub total: u32,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FileTransferSession {
    /// Key name (stem for photos, full name otherwise).
    name: String,
    kind: CmdType,
    file_size: u32,
    /// Chunk size declared by the first packet; the final chunk may be short.
    pack_size: u16,
    total_packets: u32,
    chunks: HashMap<u16, Vec<u8>>,
    started: Instant,
    last_activity: Instant,
}

impl FileTransferSession {
    fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.total_packets
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.file_size as usize);
        for index in 0..self.total_packets {
            if let Some(chunk) = self.chunks.remove(&(index as u16)) {
                data.extend_from_slice(&chunk);
            }
        }
        data
    }
}

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

/// Index-keyed assembly of multi-packet payloads.
#[derive(Debug)]
pub struct Reassembler {
    sessions: HashMap<String, FileTransferSession>,
    inactivity_timeout: Duration,
}

impl Reassembler {
    pub fn new(inactivity_timeout: Duration) -> Reassembler {
        Reassembler {
            sessions: HashMap::new(),
            inactivity_timeout,
        }
    }

    /// Place one decoded packet.
    pub fn ingest(&mut self, packet: FilePacket) -> IngestOutcome {
        let name = session_key(&packet);
        let now = Instant::now();

        let session = self.sessions.entry(name.clone()).or_insert_with(|| {
            let pack_size = packet.data.len() as u16;
            let total_packets = packet.file_size.div_ceil(u32::from(pack_size.max(1)));
            debug!(
                file = %name,
                total_packets,
                file_size = packet.file_size,
                "file transfer started"
            );
            FileTransferSession {
                name: name.clone(),
                kind: packet.cmd,
                file_size: packet.file_size,
                pack_size,
                total_packets,
                chunks: HashMap::new(),
                started: now,
                last_activity: now,
            }
        });
        session.last_activity = now;

        // The final chunk of a file is short. If it arrives first the
        // packet count is overestimated until a full-size chunk corrects
        // the chunk-size hint; the estimate only ever tightens downward.
        let chunk_len = packet.data.len() as u16;
        if chunk_len > session.pack_size {
            session.pack_size = chunk_len;
            session.total_packets = session.file_size.div_ceil(u32::from(chunk_len));
        }

        if u32::from(packet.pack_index) >= session.total_packets {
            return IngestOutcome::OutOfRangeRejected {
                name,
                index: packet.pack_index,
            };
        }
        if session.chunks.contains_key(&packet.pack_index) {
            return IngestOutcome::DuplicateIgnored {
                name,
                index: packet.pack_index,
            };
        }

        let started_fresh = session.chunks.is_empty();
        session.chunks.insert(packet.pack_index, packet.data);

        let complete = session.is_complete();
        let received = session.chunks.len() as u32;
        let total = session.total_packets;

        if complete {
            // Session is done either way; take it out of the map.
            if let Some(session) = self.sessions.remove(&name) {
                let kind = session.kind;
                let file_size = session.file_size;
                let elapsed = now.duration_since(session.started);
                let data = session.assemble();
                if data.len() != file_size as usize {
                    warn!(
                        file = %name,
                        declared = file_size,
                        assembled = data.len(),
                        "assembled size disagrees with declared file size; dropping"
                    );
                    return IngestOutcome::SizeMismatch {
                        name,
                        expected: file_size,
                        actual: data.len(),
                    };
                }
                return IngestOutcome::Complete {
                    name,
                    kind,
                    data,
                    elapsed,
                };
            }
        }

        if started_fresh {
            IngestOutcome::Started { name, total }
        } else {
            IngestOutcome::Appended {
                name,
                received,
                total,
            }
        }
    }

    /// Sweep sessions idle past the timeout, reporting each once.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<AbandonedSession> {
        let timeout = self.inactivity_timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .map(|s| {
                warn!(file = %s.name, received = s.chunks.len(), total = s.total_packets,
                      "file transfer abandoned");
                AbandonedSession {
                    name: s.name,
                    received: s.chunks.len() as u32,
                    total: s.total_packets,
                }
            })
            .collect()
    }

    /// Drop all in-flight sessions (disconnect).
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// BLE photo packets are keyed by stem — the photo id — so the ready
/// signal and the arriving chunks meet under one key. Everything else is
/// keyed by the full name.
fn session_key(packet: &FilePacket) -> String {
    if packet.cmd == CmdType::Photo {
        packet.file_stem().to_owned()
    } else {
        packet.file_name.clone()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
