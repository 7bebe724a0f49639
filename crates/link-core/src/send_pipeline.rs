//! Outbound send pipeline.
//!
//! One task owns the transport's write side: FIFO queue, a minimum
//! wall-clock gap between consecutive successful writes, and a
//! write-complete handshake per item (the transport's `write` resolves on
//! completion). A failed write is retried once at the head after a longer
//! pause; a second failure is surfaced to the state machine as a link
//! fault. Constrained peers get a length-capped queue that sheds the
//! oldest entries — on a display-only peer the freshest frame supersedes
//! stale renders.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::bus::{EventBus, LinkEvent};
use crate::transport::{BleTransport, TransportError};

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PipelineCommand {
    Enqueue(Vec<u8>),
    Clear,
}

/// Fault feedback from the pipeline to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSignal {
    /// Two consecutive failures writing the same item; the link is gone.
    WriteFailed { error: TransportError },
}

/// Cloneable enqueue handle. Dropping every handle stops the task once the
/// queue drains.
#[derive(Debug, Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl SendQueue {
    /// Non-blocking enqueue. Returns false when the pipeline task is gone.
    pub fn enqueue(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(PipelineCommand::Enqueue(bytes)).is_ok()
    }

    /// Drop everything queued (disconnect path).
    pub fn clear(&self) {
        let _ = self.tx.send(PipelineCommand::Clear);
    }
}

// ---------------------------------------------------------------------------
// Pipeline settings
// ---------------------------------------------------------------------------

/// Per-link pipeline parameters, derived from config + peer params.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_send_interval: Duration,
    /// Some(cap) for constrained peers; None leaves the queue unbounded.
    pub queue_cap: Option<usize>,
    /// Characteristic every frame is written to.
    pub characteristic: String,
}

/// Spawn the pipeline task for one link session.
pub fn spawn(
    transport: Arc<dyn BleTransport>,
    settings: PipelineSettings,
    signal_tx: mpsc::UnboundedSender<PipelineSignal>,
    bus: EventBus,
) -> SendQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(transport, settings, rx, signal_tx, bus));
    SendQueue { tx }
}

// ---------------------------------------------------------------------------
// Task body
// ---------------------------------------------------------------------------

struct QueueState {
    items: VecDeque<Vec<u8>>,
    cap: Option<usize>,
}

impl QueueState {
    fn push(&mut self, bytes: Vec<u8>, bus: &EventBus) {
        if let Some(cap) = self.cap {
            while self.items.len() >= cap {
                self.items.pop_front();
                bus.publish(LinkEvent::QueueDropped { count: 1 });
            }
        }
        self.items.push_back(bytes);
    }
}

async fn run(
    transport: Arc<dyn BleTransport>,
    settings: PipelineSettings,
    mut rx: mpsc::UnboundedReceiver<PipelineCommand>,
    signal_tx: mpsc::UnboundedSender<PipelineSignal>,
    bus: EventBus,
) {
    let mut queue = QueueState {
        items: VecDeque::new(),
        cap: settings.queue_cap,
    };
    let mut last_send: Option<Instant> = None;
    let mut head_retried = false;

    loop {
        // Block for work, absorbing commands as they arrive.
        while queue.items.is_empty() {
            match rx.recv().await {
                Some(PipelineCommand::Enqueue(bytes)) => queue.push(bytes, &bus),
                Some(PipelineCommand::Clear) => queue.items.clear(),
                None => return,
            }
        }

        // Enforce the inter-write gap without going deaf to commands.
        if let Some(sent_at) = last_send {
            let eligible = sent_at + settings.min_send_interval;
            if !pause_until(eligible, &mut rx, &mut queue, &bus).await {
                return;
            }
            if queue.items.is_empty() {
                continue; // a Clear landed during the pause
            }
        }

        // INVARIANT: queue is non-empty here; the head stays put until its
        // write succeeds or the pipeline gives up on the link.
        let head = queue.items.front().cloned().unwrap_or_default();
        match transport.write(&settings.characteristic, &head).await {
            Ok(()) => {
                last_send = Some(Instant::now());
                queue.items.pop_front();
                head_retried = false;
            }
            Err(error) if !head_retried => {
                warn!(%error, "transport write failed; retrying head once");
                head_retried = true;
                let resume = Instant::now() + settings.min_send_interval * 2;
                if !pause_until(resume, &mut rx, &mut queue, &bus).await {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "transport write failed twice; surfacing link fault");
                let _ = signal_tx.send(PipelineSignal::WriteFailed { error });
                return;
            }
        }
    }
}

/// Sleep until `deadline` while continuing to drain commands.
/// Returns false when every handle is gone and the task should exit.
async fn pause_until(
    deadline: Instant,
    rx: &mut mpsc::UnboundedReceiver<PipelineCommand>,
    queue: &mut QueueState,
    bus: &EventBus,
) -> bool {
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = rx.recv() => match cmd {
                Some(PipelineCommand::Enqueue(bytes)) => queue.push(bytes, bus),
                Some(PipelineCommand::Clear) => queue.items.clear(),
                None => return false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
