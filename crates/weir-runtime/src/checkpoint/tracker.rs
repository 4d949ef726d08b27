//! At-least-once barrier tracking.

use super::{BarrierHandler, Responder};
use crate::context::StreamContext;
use crate::envelope::{Barrier, Envelope, Payload};
use rustc_hash::FxHashMap;
use tracing::error;

/// Counts barrier arrivals per checkpoint id and triggers the responder
/// once every input has delivered its barrier. Never blocks or reorders
/// data; a slow input delays only its own snapshot, never tuples.
pub struct BarrierTracker {
    responder: Box<dyn Responder>,
    input_count: usize,
    pending: FxHashMap<i64, usize>,
}

impl BarrierTracker {
    pub fn new(responder: Box<dyn Responder>, input_count: usize) -> Self {
        Self {
            responder,
            input_count,
            pending: FxHashMap::default(),
        }
    }

    /// Number of snapshots currently awaiting barriers.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn process_barrier(&mut self, barrier: &Barrier) {
        if self.input_count == 1 {
            if let Err(e) = self.responder.trigger_checkpoint(barrier.checkpoint_id) {
                error!(
                    op = self.responder.name(),
                    checkpoint_id = barrier.checkpoint_id,
                    "trigger checkpoint err: {e}"
                );
            }
            return;
        }
        let count = self.pending.entry(barrier.checkpoint_id).or_insert(0);
        *count += 1;
        if *count == self.input_count {
            if let Err(e) = self.responder.trigger_checkpoint(barrier.checkpoint_id) {
                error!(
                    op = self.responder.name(),
                    checkpoint_id = barrier.checkpoint_id,
                    "trigger checkpoint err: {e}"
                );
                return;
            }
            self.pending.remove(&barrier.checkpoint_id);
            // Older pending snapshots are stalled: a newer one just
            // completed, so they can never finish. Drop them.
            self.pending.retain(|id, _| *id >= barrier.checkpoint_id);
        }
    }
}

impl BarrierHandler for BarrierTracker {
    fn process(&mut self, data: Envelope, _ctx: &StreamContext) -> Option<Envelope> {
        match &data.payload {
            Payload::Barrier(b) => {
                let b = b.clone();
                self.process_barrier(&b);
                None
            }
            _ => Some(data),
        }
    }
}
