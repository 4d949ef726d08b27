//! The generic unary operator: hosts user logic over a stream of envelopes.

use super::{
    broadcast, drain_error, AggregateEvaluator, Applied, FunctionEvaluator, NodeCore,
    NoopEvaluator, Operation, Operator,
};
use crate::checkpoint::BarrierHandler;
use crate::context::StreamContext;
use crate::envelope::Envelope;
use crate::error::RuntimeError;
use crate::metrics::{Metrics, OpMetrics, StatManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Hosts a user [`Operation`] behind `concurrency` scheduling tasks.
///
/// Each task demultiplexes its slice of the input channel, inspects
/// barriers, applies the operation, and broadcasts results with
/// backpressure. Operator-internal state shared across tasks (the stat
/// manager list, the cancelled flag) is mutex-guarded and written only at
/// task start and cancellation.
pub struct UnaryOperator {
    core: NodeCore,
    op: Option<Arc<dyn Operation>>,
    fv: Arc<dyn FunctionEvaluator>,
    afv: Arc<dyn AggregateEvaluator>,
    concurrency: usize,
    metrics: Metrics,
    stat_managers: Arc<RwLock<Vec<StatManager>>>,
    cancelled: Arc<Mutex<bool>>,
    barrier_handler: Option<Box<dyn BarrierHandler>>,
}

impl UnaryOperator {
    pub fn new(name: &str, buffer_length: usize, concurrency: usize, metrics: Metrics) -> Self {
        Self {
            core: NodeCore::new(name, buffer_length, true),
            op: None,
            fv: Arc::new(NoopEvaluator),
            afv: Arc::new(NoopEvaluator),
            concurrency: concurrency.max(1),
            metrics,
            stat_managers: Arc::new(RwLock::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(false)),
            barrier_handler: None,
        }
    }

    /// Set the hosted operation.
    pub fn set_operation(&mut self, op: Arc<dyn Operation>) {
        self.op = Some(op);
    }

    /// Install compiled expression evaluators; defaults to no-op
    /// evaluators for operations that reference no SQL functions.
    pub fn set_evaluators(
        &mut self,
        fv: Arc<dyn FunctionEvaluator>,
        afv: Arc<dyn AggregateEvaluator>,
    ) {
        self.fv = fv;
        self.afv = afv;
    }

    /// Whether to forward user errors downstream as error envelopes.
    pub fn set_send_error(&mut self, send_error: bool) {
        self.core.send_error = send_error;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Operator for UnaryOperator {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn exec(&mut self, ctx: StreamContext, err_tx: mpsc::Sender<RuntimeError>) {
        let log_ctx = ctx.with_op(self.core.name.clone());
        debug!(op = %self.core.name, "unary operator is started");

        let Some(op) = self.op.clone() else {
            info!(op = %self.core.name, "unary operator missing operation");
            return;
        };
        if self.core.outputs.is_empty() {
            drain_error(
                &log_ctx,
                &err_tx,
                RuntimeError::NoOutput(self.core.name.to_string()),
            );
            return;
        }

        let Some(input_rx) = self.core.input_rx.take() else {
            debug!(op = %self.core.name, "unary operator already started");
            return;
        };
        let input = Arc::new(tokio::sync::Mutex::new(input_rx));

        // A barrier handler's maps are private to one task; force a single
        // slice when one is installed.
        let mut handler = self.barrier_handler.take();
        let concurrency = if handler.is_some() {
            if self.concurrency > 1 {
                warn!(op = %self.core.name, "barrier handling runs single-sliced, concurrency reduced to 1");
            }
            1
        } else {
            self.concurrency
        };

        self.stat_managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        for instance in 0..concurrency {
            let task = InstanceTask {
                name: self.core.name.clone(),
                op: op.clone(),
                fv: self.fv.clone(),
                afv: self.afv.clone(),
                outputs: self.core.outputs.clone(),
                input: input.clone(),
                input_tx: self.core.input_tx.clone(),
                handler: handler.take(),
                metrics: self.metrics.clone(),
                stat_managers: self.stat_managers.clone(),
                cancelled: self.cancelled.clone(),
                send_error: self.core.send_error,
            };
            let ctx = log_ctx.with_instance(instance);
            let err_tx = err_tx.clone();
            tokio::spawn(task.run(ctx, err_tx));
        }
    }

    fn add_output(&mut self, name: &str, tx: mpsc::Sender<Envelope>) {
        self.core.add_output(name, tx);
    }

    fn input(&self) -> mpsc::Sender<Envelope> {
        self.core.input_tx.clone()
    }

    fn set_barrier_handler(&mut self, handler: Box<dyn BarrierHandler>) {
        self.barrier_handler = Some(handler);
    }

    fn get_metrics(&self) -> Vec<OpMetrics> {
        self.stat_managers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.snapshot())
            .collect()
    }
}

struct InstanceTask {
    name: Arc<str>,
    op: Arc<dyn Operation>,
    fv: Arc<dyn FunctionEvaluator>,
    afv: Arc<dyn AggregateEvaluator>,
    outputs: HashMap<String, mpsc::Sender<Envelope>>,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    input_tx: mpsc::Sender<Envelope>,
    handler: Option<Box<dyn BarrierHandler>>,
    metrics: Metrics,
    stat_managers: Arc<RwLock<Vec<StatManager>>>,
    cancelled: Arc<Mutex<bool>>,
    send_error: bool,
}

impl InstanceTask {
    async fn run(mut self, ctx: StreamContext, err_tx: mpsc::Sender<RuntimeError>) {
        // Child context handed to the operation; cancelled when the task
        // exits so the operation's own futures stop with it.
        let exec_ctx = ctx.with_cancel();

        let mut stats =
            match self
                .metrics
                .stat_manager(ctx.rule_id(), ctx.op_id(), ctx.instance_id())
            {
                Ok(stats) => stats,
                Err(e) => {
                    drain_error(&ctx, &err_tx, e);
                    return;
                }
            };
        self.stat_managers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(stats.clone());

        loop {
            // Receive from this task's input slice; holding the lock only
            // while suspended on recv keeps slices disjoint.
            let received = {
                let mut input = self.input.lock().await;
                tokio::select! {
                    item = input.recv() => item,
                    _ = exec_ctx.cancelled() => {
                        self.finish(&ctx, &exec_ctx);
                        return;
                    }
                }
            };
            let Some(env) = received else {
                info!(op = %self.name, instance = ctx.instance_id(), "input channel closed");
                self.finish(&ctx, &exec_ctx);
                return;
            };

            // Barrier inspection: a consumed envelope ends here.
            let env = match self.handler.as_mut() {
                Some(handler) => match handler.process(env, &exec_ctx) {
                    Some(env) => env,
                    None => continue,
                },
                None => env,
            };

            stats.inc_records_in();
            stats.process_time_start();

            match self.op.apply(&exec_ctx, env.payload, &*self.fv, &*self.afv) {
                Applied::Drop => continue,
                Applied::Error(msg) => {
                    error!(op = %self.name, "operation error: {msg}");
                    if self.send_error {
                        let env = Envelope::error(msg, self.name.clone());
                        if broadcast(&self.outputs, &exec_ctx, env).await.is_err() {
                            self.finish(&ctx, &exec_ctx);
                            return;
                        }
                    }
                    stats.inc_exceptions();
                    continue;
                }
                Applied::Forward(payload) => {
                    stats.process_time_end();
                    let env = Envelope::new(payload, self.name.clone());
                    if broadcast(&self.outputs, &exec_ctx, env).await.is_err() {
                        self.finish(&ctx, &exec_ctx);
                        return;
                    }
                    stats.inc_records_out();
                    let queued =
                        self.input_tx.max_capacity() - self.input_tx.capacity();
                    stats.set_buffer_length(queued as i64);
                }
            }
        }
    }

    fn finish(&self, ctx: &StreamContext, exec_ctx: &StreamContext) {
        info!(op = %self.name, instance = ctx.instance_id(), "unary operator instance done, cancelling future items");
        {
            let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
            *cancelled = true;
        }
        exec_ctx.cancel();
    }
}
