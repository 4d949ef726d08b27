//! Rule orchestration: build the operator graph, wire channels, start it.
//!
//! A [`Rule`] owns the operators of one compiled statement. Starting it
//! wires every edge as a bounded channel, installs barrier handlers
//! according to the rule's QoS, registers responders with the checkpoint
//! coordinator, distributes a single error channel, and spawns every
//! operator's scheduling tasks. Back-edges are logical names resolved at
//! wiring time, never ownership pointers.

use crate::checkpoint::{BarrierAligner, BarrierEmitter, BarrierTracker, Coordinator};
use crate::context::StreamContext;
use crate::envelope::Envelope;
use crate::error::RuntimeError;
use crate::metrics::OpMetrics;
use crate::operator::Operator;
use crate::state::StateStore;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use weir_core::{Qos, RuleOptions};

/// An acyclic dataflow graph compiled from one statement.
pub struct Rule {
    name: String,
    options: RuleOptions,
    operators: IndexMap<String, Box<dyn Operator>>,
    /// Operator-to-operator edges, by logical name.
    edges: Vec<(String, String)>,
    /// Source edges: external feed name into an operator.
    source_edges: Vec<(String, String)>,
    /// Sink edges: operator into an external channel.
    sinks: Vec<(String, String, mpsc::Sender<Envelope>)>,
    emitters: Vec<Arc<dyn BarrierEmitter>>,
}

impl Rule {
    pub fn new(name: impl Into<String>, options: RuleOptions) -> Self {
        Self {
            name: name.into(),
            options,
            operators: IndexMap::new(),
            edges: Vec::new(),
            source_edges: Vec::new(),
            sinks: Vec::new(),
            emitters: Vec::new(),
        }
    }

    pub fn options(&self) -> &RuleOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RuleOptions {
        &mut self.options
    }

    pub fn add_operator(&mut self, op: Box<dyn Operator>) {
        self.operators.insert(op.name().to_string(), op);
    }

    /// Connect two operators by name.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), RuntimeError> {
        if !self.operators.contains_key(from) {
            return Err(RuntimeError::Operation(format!("unknown operator {from}")));
        }
        if !self.operators.contains_key(to) {
            return Err(RuntimeError::Operation(format!("unknown operator {to}")));
        }
        self.edges.push((from.to_string(), to.to_string()));
        Ok(())
    }

    /// Register an external source feeding `to`, returning the sender the
    /// source adapter emits envelopes on.
    pub fn source_input(
        &mut self,
        source_name: &str,
        to: &str,
    ) -> Result<mpsc::Sender<Envelope>, RuntimeError> {
        let op = self
            .operators
            .get(to)
            .ok_or_else(|| RuntimeError::Operation(format!("unknown operator {to}")))?;
        self.source_edges
            .push((source_name.to_string(), to.to_string()));
        Ok(op.input())
    }

    /// Register an external sink consuming from `from`.
    pub fn add_sink(
        &mut self,
        from: &str,
        sink_name: &str,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<(), RuntimeError> {
        if !self.operators.contains_key(from) {
            return Err(RuntimeError::Operation(format!("unknown operator {from}")));
        }
        self.sinks
            .push((from.to_string(), sink_name.to_string(), tx));
        Ok(())
    }

    /// Register a source's barrier emitter with the checkpoint coordinator.
    pub fn add_barrier_emitter(&mut self, emitter: Arc<dyn BarrierEmitter>) {
        self.emitters.push(emitter);
    }

    fn input_count(&self, op: &str) -> usize {
        let wired = self
            .edges
            .iter()
            .filter(|(_, to)| to == op)
            .chain(self.source_edges.iter().filter(|(_, to)| to == op))
            .count();
        wired.max(1)
    }

    /// Wire the graph and spawn every operator. Must be called from within
    /// a tokio runtime. The returned handle owns the operators (for
    /// metrics) and the cancellation signal.
    pub fn start(mut self, store: Arc<dyn StateStore>) -> Result<RuleHandle, RuntimeError> {
        let ctx = StreamContext::new(self.name.clone(), store);
        let (err_tx, err_rx) = mpsc::channel(8);

        // Data edges first so operators see their outputs at exec time.
        for (from, to) in &self.edges {
            let tx = self.operators[to].input();
            let from_op = self
                .operators
                .get_mut(from)
                .ok_or_else(|| RuntimeError::Operation(format!("unknown operator {from}")))?;
            from_op.add_output(to, tx);
        }
        for (from, sink_name, tx) in std::mem::take(&mut self.sinks) {
            let from_op = self
                .operators
                .get_mut(&from)
                .ok_or_else(|| RuntimeError::Operation(format!("unknown operator {from}")))?;
            from_op.add_output(&sink_name, tx);
        }

        // Barrier handlers and the coordinator, for checkpointing rules.
        let coordinator = if self.options.qos > Qos::AtMostOnce {
            let mut coordinator =
                Coordinator::new(Duration::from_millis(self.options.checkpoint_interval_ms));
            for emitter in std::mem::take(&mut self.emitters) {
                coordinator.add_source(emitter);
            }
            let names: Vec<String> = self.operators.keys().cloned().collect();
            for name in names {
                let input_count = self.input_count(&name);
                let responder = Box::new(coordinator.responder(name.clone()));
                let Some(op) = self.operators.get_mut(&name) else {
                    continue;
                };
                match self.options.qos {
                    Qos::ExactlyOnce => {
                        // Buffered envelopes are re-enqueued on the
                        // operator's own input once alignment completes.
                        op.set_barrier_handler(Box::new(BarrierAligner::new(
                            responder,
                            input_count,
                            op.input(),
                        )));
                    }
                    _ => {
                        op.set_barrier_handler(Box::new(BarrierTracker::new(
                            responder,
                            input_count,
                        )));
                    }
                }
            }
            Some(coordinator)
        } else {
            None
        };

        info!(
            rule = %self.name,
            operators = self.operators.len(),
            qos = ?self.options.qos,
            "starting rule"
        );
        for (_, op) in self.operators.iter_mut() {
            op.exec(ctx.clone(), err_tx.clone());
        }
        if let Some(coordinator) = coordinator {
            coordinator.exec(ctx.with_op("checkpoint"));
        }

        Ok(RuleHandle {
            name: self.name,
            ctx,
            operators: self.operators,
            err_rx,
        })
    }
}

/// A running rule. Dropping the handle does not stop the rule; call
/// [`RuleHandle::stop`].
pub struct RuleHandle {
    name: String,
    ctx: StreamContext,
    operators: IndexMap<String, Box<dyn Operator>>,
    err_rx: mpsc::Receiver<RuntimeError>,
}

impl RuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next rule-wide error.
    pub async fn next_error(&mut self) -> Option<RuntimeError> {
        self.err_rx.recv().await
    }

    /// Signal cancellation to every scheduling task. Tasks observe it
    /// within one iteration of their loops and drain in bounded time.
    pub fn stop(&self) {
        info!(rule = %self.name, "stopping rule");
        self.ctx.cancel();
    }

    /// Metric snapshots per operator, one entry per scheduling task.
    pub fn metrics(&self) -> Vec<(String, Vec<OpMetrics>)> {
        self.operators
            .iter()
            .map(|(name, op)| (name.clone(), op.get_metrics()))
            .collect()
    }
}
