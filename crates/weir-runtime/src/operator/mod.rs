//! Operators: the nodes of a rule graph.
//!
//! Every operator owns a bounded input channel and a set of named output
//! channels. `exec` spawns the operator's scheduling tasks and returns;
//! tasks run until the rule-wide cancellation signal. Within a task
//! execution is strictly sequential; a task suspends only on channel
//! receive, channel send (backpressure), ticker/timeout fire, or
//! cancellation.

pub mod unary;
pub mod window;

pub use unary::UnaryOperator;
pub use window::WindowOperator;

use crate::checkpoint::BarrierHandler;
use crate::context::StreamContext;
use crate::envelope::{Envelope, Payload};
use crate::error::RuntimeError;
use crate::metrics::OpMetrics;
use crate::tuple::SharedTuple;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use weir_core::Value;

/// Scalar function evaluator compiled by the SQL layer.
pub trait FunctionEvaluator: Send + Sync {
    fn call(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError>;
}

/// Aggregate function evaluator compiled by the SQL layer, applied over a
/// window's content.
pub trait AggregateEvaluator: Send + Sync {
    fn call(&self, name: &str, content: &[SharedTuple]) -> Result<Value, RuntimeError>;
}

/// Evaluator for operations that reference no SQL functions.
pub struct NoopEvaluator;

impl FunctionEvaluator for NoopEvaluator {
    fn call(&self, name: &str, _args: &[Value]) -> Result<Value, RuntimeError> {
        Err(RuntimeError::Operation(format!("unknown function {name}")))
    }
}

impl AggregateEvaluator for NoopEvaluator {
    fn call(&self, name: &str, _content: &[SharedTuple]) -> Result<Value, RuntimeError> {
        Err(RuntimeError::Operation(format!(
            "unknown aggregate function {name}"
        )))
    }
}

/// Outcome of a user operation.
#[derive(Debug)]
pub enum Applied {
    /// Broadcast downstream and count as output.
    Forward(Payload),
    /// Broadcast as an error envelope and count as exception.
    Error(String),
    /// Drop the item silently.
    Drop,
}

/// User logic hosted by the unary operator (map, filter, project,
/// aggregate). Implementations must not block.
pub trait Operation: Send + Sync {
    fn apply(
        &self,
        ctx: &StreamContext,
        item: Payload,
        fv: &dyn FunctionEvaluator,
        afv: &dyn AggregateEvaluator,
    ) -> Applied;
}

/// Closures over `(ctx, item)` act as operations, for logic that needs no
/// evaluators.
impl<F> Operation for F
where
    F: Fn(&StreamContext, Payload) -> Applied + Send + Sync,
{
    fn apply(
        &self,
        ctx: &StreamContext,
        item: Payload,
        _fv: &dyn FunctionEvaluator,
        _afv: &dyn AggregateEvaluator,
    ) -> Applied {
        self(ctx, item)
    }
}

/// Interface the rule runtime drives operators through.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Spawn the operator's scheduling tasks. Initialization errors are
    /// drained to `err_tx` and the operator does not start.
    fn exec(&mut self, ctx: StreamContext, err_tx: mpsc::Sender<RuntimeError>);

    /// Register a downstream channel under a logical name.
    fn add_output(&mut self, name: &str, tx: mpsc::Sender<Envelope>);

    /// Sender side of this operator's input channel, used for wiring.
    fn input(&self) -> mpsc::Sender<Envelope>;

    /// Install the barrier handler for this operator's QoS level. Must be
    /// called before `exec`.
    fn set_barrier_handler(&mut self, handler: Box<dyn BarrierHandler>);

    /// Current metric values, one entry per scheduling task.
    fn get_metrics(&self) -> Vec<OpMetrics>;
}

/// Channel plumbing shared by operator implementations.
pub(crate) struct NodeCore {
    pub name: Arc<str>,
    pub outputs: HashMap<String, mpsc::Sender<Envelope>>,
    pub input_tx: mpsc::Sender<Envelope>,
    pub input_rx: Option<mpsc::Receiver<Envelope>>,
    pub send_error: bool,
}

impl NodeCore {
    pub fn new(name: impl Into<Arc<str>>, buffer_length: usize, send_error: bool) -> Self {
        let (input_tx, input_rx) = mpsc::channel(buffer_length.max(1));
        Self {
            name: name.into(),
            outputs: HashMap::new(),
            input_tx,
            input_rx: Some(input_rx),
            send_error,
        }
    }

    pub fn add_output(&mut self, name: &str, tx: mpsc::Sender<Envelope>) {
        self.outputs.insert(name.to_string(), tx);
    }
}

/// Send an envelope to every downstream channel. Blocks on a full
/// downstream (natural backpressure) but stays cancellable; returns
/// `Err(Cancelled)` if the rule is cancelled mid-send. A closed downstream
/// is logged and skipped.
pub(crate) async fn broadcast(
    outputs: &HashMap<String, mpsc::Sender<Envelope>>,
    ctx: &StreamContext,
    env: Envelope,
) -> Result<(), RuntimeError> {
    for (name, tx) in outputs {
        tokio::select! {
            res = tx.send(env.clone()) => {
                if res.is_err() {
                    warn!(op = ctx.op_id(), output = %name, "downstream channel closed");
                }
            }
            _ = ctx.cancelled() => return Err(RuntimeError::Cancelled),
        }
    }
    Ok(())
}

/// Report an error on the rule-wide error channel without blocking the
/// operator: the send races cancellation from a spawned task.
pub(crate) fn drain_error(
    ctx: &StreamContext,
    err_tx: &mpsc::Sender<RuntimeError>,
    err: RuntimeError,
) {
    error!(rule = ctx.rule_id(), op = ctx.op_id(), "operator error: {err}");
    let ctx = ctx.clone();
    let err_tx = err_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = err_tx.send(err) => {}
            _ = ctx.cancelled() => {}
        }
    });
}
