//! Exactly-once barrier alignment.

use super::{BarrierHandler, Responder};
use crate::context::StreamContext;
use crate::envelope::{Barrier, Envelope, Payload};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Blocks each input once its barrier for the current checkpoint arrives,
/// buffering that input's envelopes until all inputs have delivered the
/// barrier. On trigger, the buffer is flushed back to `output` in arrival
/// order from a spawned task so the handler itself never blocks.
///
/// When a barrier for a higher checkpoint id arrives mid-alignment the
/// current alignment is aborted and a new one begins at the higher id. The
/// buffer is carried forward across the abort: its envelopes were observed
/// before the new barriers on their channels, so they belong to the new
/// snapshot and are flushed when it completes.
pub struct BarrierAligner {
    responder: Box<dyn Responder>,
    input_count: usize,
    current_checkpoint_id: i64,
    output: mpsc::Sender<Envelope>,
    blocked: FxHashSet<Arc<str>>,
    buffer: Vec<Envelope>,
}

impl BarrierAligner {
    pub fn new(
        responder: Box<dyn Responder>,
        input_count: usize,
        output: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            responder,
            input_count,
            current_checkpoint_id: 0,
            output,
            blocked: FxHashSet::default(),
            buffer: Vec::new(),
        }
    }

    /// Number of inputs blocked by the in-flight alignment.
    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Number of envelopes buffered for blocked inputs.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn process_barrier(&mut self, barrier: &Barrier) {
        debug!(
            op = self.responder.name(),
            checkpoint_id = barrier.checkpoint_id,
            channel = %barrier.op_id,
            "aligner process barrier"
        );
        if self.input_count == 1 {
            if barrier.checkpoint_id > self.current_checkpoint_id {
                self.current_checkpoint_id = barrier.checkpoint_id;
                if let Err(e) = self.responder.trigger_checkpoint(barrier.checkpoint_id) {
                    error!(
                        op = self.responder.name(),
                        checkpoint_id = barrier.checkpoint_id,
                        "trigger checkpoint err: {e}"
                    );
                }
            }
            return;
        }
        if !self.blocked.is_empty() {
            if barrier.checkpoint_id == self.current_checkpoint_id {
                self.block_channel(&barrier.op_id);
            } else if barrier.checkpoint_id > self.current_checkpoint_id {
                info!(
                    op = self.responder.name(),
                    new = barrier.checkpoint_id,
                    current = self.current_checkpoint_id,
                    "received barrier for a newer checkpoint before the current one completed, skipping current"
                );
                self.blocked.clear();
                self.begin_new_alignment(barrier);
            } else {
                // Late barrier for a superseded snapshot.
                return;
            }
        } else if barrier.checkpoint_id > self.current_checkpoint_id {
            self.begin_new_alignment(barrier);
        } else {
            return;
        }
        if self.blocked.len() == self.input_count {
            debug!(
                op = self.responder.name(),
                checkpoint_id = self.current_checkpoint_id,
                "received all barriers, triggering checkpoint"
            );
            if let Err(e) = self.responder.trigger_checkpoint(self.current_checkpoint_id) {
                error!(
                    op = self.responder.name(),
                    checkpoint_id = self.current_checkpoint_id,
                    "trigger checkpoint err: {e}"
                );
                return;
            }
            self.blocked.clear();
            // Flush asynchronously in arrival order; the handler's own task
            // must not block on a full downstream.
            let drained = std::mem::take(&mut self.buffer);
            let output = self.output.clone();
            tokio::spawn(async move {
                for env in drained {
                    if output.send(env).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn block_channel(&mut self, name: &str) {
        if !self.blocked.contains(name) {
            self.blocked.insert(Arc::from(name));
            debug!(op = self.responder.name(), channel = name, "blocked channel");
        }
    }

    fn begin_new_alignment(&mut self, barrier: &Barrier) {
        self.current_checkpoint_id = barrier.checkpoint_id;
        self.block_channel(&barrier.op_id);
        debug!(
            op = self.responder.name(),
            checkpoint_id = barrier.checkpoint_id,
            "starting stream alignment"
        );
    }
}

impl BarrierHandler for BarrierAligner {
    fn process(&mut self, data: Envelope, _ctx: &StreamContext) -> Option<Envelope> {
        match &data.payload {
            Payload::Barrier(b) => {
                let b = b.clone();
                self.process_barrier(&b);
                None
            }
            _ => {
                if self.input_count > 1
                    && !self.blocked.is_empty()
                    && self.blocked.contains(&data.channel_id)
                {
                    self.buffer.push(data);
                    return None;
                }
                Some(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use crate::tuple::Tuple;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Duration};

    struct RecordingResponder {
        triggered: Arc<Mutex<Vec<i64>>>,
    }

    impl Responder for RecordingResponder {
        fn trigger_checkpoint(&self, checkpoint_id: i64) -> Result<(), crate::RuntimeError> {
            self.triggered.lock().unwrap().push(checkpoint_id);
            Ok(())
        }

        fn name(&self) -> &str {
            "test-op"
        }
    }

    fn aligner(
        input_count: usize,
    ) -> (
        BarrierAligner,
        mpsc::Receiver<Envelope>,
        Arc<Mutex<Vec<i64>>>,
    ) {
        let triggered = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(16);
        let aligner = BarrierAligner::new(
            Box::new(RecordingResponder {
                triggered: triggered.clone(),
            }),
            input_count,
            tx,
        );
        (aligner, rx, triggered)
    }

    fn ctx() -> StreamContext {
        StreamContext::new("rule1", Arc::new(MemoryStore::new()))
    }

    fn tuple_from(channel: &str, ts: i64) -> Envelope {
        Envelope::tuple(Tuple::new_at(channel, ts).shared(), channel)
    }

    fn barrier_from(channel: &str, id: i64) -> Envelope {
        Envelope::barrier(Barrier::new(id, channel), channel)
    }

    #[tokio::test]
    async fn test_buffering_and_in_order_flush() {
        let (mut aligner, mut rx, triggered) = aligner(2);
        let ctx = ctx();

        // t1 on A passes through: no alignment yet.
        let t1 = tuple_from("a", 1);
        assert_eq!(aligner.process(t1.clone(), &ctx), Some(t1));

        // Barrier on A begins alignment; A is now blocked.
        assert!(aligner.process(barrier_from("a", 1), &ctx).is_none());
        assert_eq!(aligner.blocked_len(), 1);

        // t2 on A is buffered, t3 on B passes through.
        assert!(aligner.process(tuple_from("a", 2), &ctx).is_none());
        assert_eq!(aligner.buffered_len(), 1);
        let t3 = tuple_from("b", 3);
        assert_eq!(aligner.process(t3.clone(), &ctx), Some(t3));

        // Barrier on B completes the alignment: trigger, then async flush.
        assert!(aligner.process(barrier_from("b", 1), &ctx).is_none());
        assert_eq!(*triggered.lock().unwrap(), vec![1]);
        assert_eq!(aligner.blocked_len(), 0);
        assert_eq!(aligner.buffered_len(), 0);

        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            flushed.payload.as_tuple().map(|t| t.timestamp),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_supersede_carries_buffer_forward() {
        let (mut aligner, mut rx, triggered) = aligner(2);
        let ctx = ctx();

        aligner.process(barrier_from("a", 1), &ctx);
        aligner.process(tuple_from("a", 10), &ctx);
        assert_eq!(aligner.buffered_len(), 1);

        // Higher id on B aborts the alignment at 1 and begins one at 2.
        aligner.process(barrier_from("b", 2), &ctx);
        assert!(triggered.lock().unwrap().is_empty());
        assert_eq!(aligner.blocked_len(), 1);
        // Buffer survives the supersede.
        assert_eq!(aligner.buffered_len(), 1);

        // Late barrier for the superseded snapshot is ignored.
        aligner.process(barrier_from("a", 1), &ctx);
        assert!(triggered.lock().unwrap().is_empty());

        // Barrier at 2 on A completes the new alignment.
        aligner.process(barrier_from("a", 2), &ctx);
        assert_eq!(*triggered.lock().unwrap(), vec![2]);

        let flushed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flushed.payload.as_tuple().map(|t| t.timestamp), Some(10));
    }

    #[tokio::test]
    async fn test_single_input_advances_monotonically() {
        let (mut aligner, _rx, triggered) = aligner(1);
        let ctx = ctx();

        aligner.process(barrier_from("a", 1), &ctx);
        aligner.process(barrier_from("a", 1), &ctx);
        aligner.process(barrier_from("a", 3), &ctx);
        aligner.process(barrier_from("a", 2), &ctx);

        assert_eq!(*triggered.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_stale_barrier_without_alignment_is_ignored() {
        let (mut aligner, _rx, triggered) = aligner(2);
        let ctx = ctx();

        aligner.process(barrier_from("a", 5), &ctx);
        aligner.process(barrier_from("b", 5), &ctx);
        assert_eq!(*triggered.lock().unwrap(), vec![5]);

        // After completion nothing is blocked; an old id starts nothing.
        aligner.process(barrier_from("a", 4), &ctx);
        assert_eq!(aligner.blocked_len(), 0);
        assert_eq!(*triggered.lock().unwrap(), vec![5]);
    }
}
