//! Checkpoint coordinator: periodic barrier emission and ack collection.

use super::Responder;
use crate::context::StreamContext;
use crate::error::RuntimeError;
use crate::state::{StateValue, CHECKPOINT_LIST_KEY};
use crate::tuple::now_millis;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Implemented by source adapters. On request, the source emits a barrier
/// with the given checkpoint id, stamped with its own name, in-band on
/// every one of its output channels.
pub trait BarrierEmitter: Send + Sync {
    fn emit_barrier(&self, checkpoint_id: i64);
}

/// Snapshot acknowledgement sent by an operator's responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub op_id: String,
    pub checkpoint_id: i64,
}

/// Per-operator [`Responder`] that reports snapshot completion back to the
/// coordinator. The send is unbounded so a triggering handler never blocks.
pub struct AckResponder {
    op_id: String,
    ack_tx: mpsc::UnboundedSender<Ack>,
}

impl Responder for AckResponder {
    fn trigger_checkpoint(&self, checkpoint_id: i64) -> Result<(), RuntimeError> {
        self.ack_tx
            .send(Ack {
                op_id: self.op_id.clone(),
                checkpoint_id,
            })
            .map_err(|_| RuntimeError::ChannelClosed("checkpoint ack".into()))
    }

    fn name(&self) -> &str {
        &self.op_id
    }
}

/// Drives checkpointing for one rule: asks every source to emit a barrier
/// at a fixed cadence, collects acks from the operators' responders, and
/// records each completed checkpoint id in the rule's state store.
pub struct Coordinator {
    interval: Duration,
    sources: Vec<Arc<dyn BarrierEmitter>>,
    responder_count: usize,
    ack_tx: mpsc::UnboundedSender<Ack>,
    ack_rx: mpsc::UnboundedReceiver<Ack>,
}

impl Coordinator {
    pub fn new(interval: Duration) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            interval,
            sources: Vec::new(),
            responder_count: 0,
            ack_tx,
            ack_rx,
        }
    }

    pub fn add_source(&mut self, emitter: Arc<dyn BarrierEmitter>) {
        self.sources.push(emitter);
    }

    /// Register an operator and get the responder its barrier handler will
    /// call on trigger.
    pub fn responder(&mut self, op_id: impl Into<String>) -> AckResponder {
        self.responder_count += 1;
        AckResponder {
            op_id: op_id.into(),
            ack_tx: self.ack_tx.clone(),
        }
    }

    /// Run the coordination loop until the rule is cancelled.
    pub fn exec(mut self, ctx: StreamContext) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut completed: Vec<i64> = match ctx.get_state(CHECKPOINT_LIST_KEY) {
                Ok(Some(StateValue::IntList(ids))) => {
                    info!(rule = ctx.rule_id(), count = ids.len(), "restored checkpoint list");
                    ids
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!(rule = ctx.rule_id(), "restore checkpoint list fails: {e}");
                    Vec::new()
                }
            };
            let mut pending: FxHashMap<i64, FxHashSet<String>> = FxHashMap::default();
            let mut last_id = completed.last().copied().unwrap_or(0);

            let mut ticker = tokio::time::interval(self.interval);
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut id = now_millis();
                        if id <= last_id {
                            id = last_id + 1;
                        }
                        last_id = id;
                        pending.insert(id, FxHashSet::default());
                        debug!(rule = ctx.rule_id(), checkpoint_id = id, "emitting barriers");
                        for source in &self.sources {
                            source.emit_barrier(id);
                        }
                    }
                    ack = self.ack_rx.recv() => {
                        let Some(ack) = ack else { return };
                        let Some(acked) = pending.get_mut(&ack.checkpoint_id) else {
                            debug!(
                                rule = ctx.rule_id(),
                                checkpoint_id = ack.checkpoint_id,
                                op = %ack.op_id,
                                "ack for unknown or superseded checkpoint"
                            );
                            continue;
                        };
                        acked.insert(ack.op_id);
                        if acked.len() == self.responder_count {
                            let id = ack.checkpoint_id;
                            pending.remove(&id);
                            // Snapshots older than a completed one can
                            // never finish.
                            pending.retain(|pid, _| *pid >= id);
                            completed.push(id);
                            if let Err(e) = ctx.put_state(
                                CHECKPOINT_LIST_KEY,
                                StateValue::IntList(completed.clone()),
                            ) {
                                warn!(rule = ctx.rule_id(), "persist checkpoint list fails: {e}");
                            }
                            info!(rule = ctx.rule_id(), checkpoint_id = id, "checkpoint complete");
                        }
                    }
                    _ = ctx.cancelled() => {
                        info!(rule = ctx.rule_id(), "cancelling checkpoint coordinator");
                        return;
                    }
                }
            }
        })
    }
}
