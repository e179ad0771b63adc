//! Batch progress events and the broadcast channel that carries them.
//!
//! The orchestrator emits a `BatchEvent` at each step of a run. Events flow
//! through a `tokio::sync::broadcast` channel to any subscribers; when nobody
//! is listening they are dropped.

use serde::{Deserialize, Serialize};

/// A progress event from one worker of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEvent {
    pub batch_id: String,
    /// Worker index, `0..workers`; `None` for batch-level events.
    pub worker: Option<usize>,
    /// Increases by one per event from the same emitter.
    pub seq: u64,
    pub event: BatchEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchEventKind {
    BatchStarted {
        entities: usize,
        workers: usize,
    },
    EntityStarted {
        entity: String,
    },
    EntityFinished {
        entity: String,
        succeeded: bool,
        merged_units: usize,
        failed_units: usize,
        elapsed_ms: u64,
    },
    SessionRecreated {
        session_id: String,
        generation: u32,
    },
    /// The worker stopped because its session could not be recreated.
    WorkerAborted {
        reason: String,
    },
    BatchFinished {
        succeeded: usize,
        failed: usize,
        not_attempted: usize,
    },
}

pub type ProgressSender = tokio::sync::broadcast::Sender<BatchEvent>;

pub type ProgressReceiver = tokio::sync::broadcast::Receiver<BatchEvent>;

/// Create a progress channel with a bounded buffer.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(256)
}

/// Emit an event, ignoring send errors (no receivers).
pub fn emit(
    tx: &Option<ProgressSender>,
    batch_id: &str,
    worker: Option<usize>,
    seq: &mut u64,
    event: BatchEventKind,
) {
    if let Some(ref sender) = tx {
        *seq += 1;
        let _ = sender.send(BatchEvent {
            batch_id: batch_id.to_string(),
            worker,
            seq: *seq,
            event,
        });
    }
}
