//! The window operator: five window flavors behind one scheduling loop.
//!
//! All flavors buffer incoming tuples and emit [`WindowResultSet`]s on
//! trigger. Time flavors trigger from a ticker (tumbling, hopping) or a
//! resettable session timeout; sliding windows trigger per tuple; count
//! windows trigger every `interval` tuples. On start the operator restores
//! its buffer, trigger time, and message count from the state store and
//! replays any windows that elapsed while it was down.

use super::{broadcast, drain_error, NodeCore, Operator};
use crate::checkpoint::BarrierHandler;
use crate::context::StreamContext;
use crate::envelope::{Envelope, Payload, WindowResultSet};
use crate::error::RuntimeError;
use crate::metrics::{Metrics, OpMetrics, StatManager};
use crate::state::{StateValue, MSG_COUNT_KEY, TRIGGER_TIME_KEY, WINDOW_INPUTS_KEY};
use crate::tuple::{now_millis, SharedTuple, Tuple};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use weir_core::{RuleOptions, WindowSpec, WindowType};

/// Collects tuples and emits time- or count-bounded groups according to the
/// window policy. Runs a single scheduling task: the buffer and trigger
/// bookkeeping are exclusively owned by that task.
pub struct WindowOperator {
    core: NodeCore,
    spec: WindowSpec,
    is_event_time: bool,
    metrics: Metrics,
    stat_managers: Arc<RwLock<Vec<StatManager>>>,
    barrier_handler: Option<Box<dyn BarrierHandler>>,
}

impl WindowOperator {
    pub fn new(
        name: &str,
        spec: WindowSpec,
        options: &RuleOptions,
        metrics: Metrics,
    ) -> Result<Self, RuntimeError> {
        let spec = spec.normalize();
        spec.validate()
            .map_err(|e| RuntimeError::Operation(e.to_string()))?;
        Ok(Self {
            core: NodeCore::new(name, options.buffer_length, options.send_error),
            spec,
            is_event_time: options.is_event_time,
            metrics,
            stat_managers: Arc::new(RwLock::new(Vec::new())),
            barrier_handler: None,
        })
    }
}

impl Operator for WindowOperator {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn exec(&mut self, ctx: StreamContext, err_tx: mpsc::Sender<RuntimeError>) {
        let ctx = ctx.with_op(self.core.name.clone());
        debug!(op = %self.core.name, "window operator is started");

        if self.core.outputs.is_empty() {
            drain_error(
                &ctx,
                &err_tx,
                RuntimeError::NoOutput(self.core.name.to_string()),
            );
            return;
        }
        let stats = match self.metrics.stat_manager(ctx.rule_id(), ctx.op_id(), 0) {
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

        let Some(input_rx) = self.core.input_rx.take() else {
            debug!(op = %self.core.name, "window operator already started");
            return;
        };

        // Restore state. Wrong types are structural errors reported on the
        // error channel; the operator continues with defaults.
        let mut inputs: Vec<SharedTuple> = Vec::new();
        match ctx.get_state(WINDOW_INPUTS_KEY) {
            Ok(Some(StateValue::Tuples(restored))) => {
                info!(op = %self.core.name, count = restored.len(), "restored window inputs");
                inputs = restored.into_iter().map(Arc::new).collect();
            }
            Ok(Some(_)) => drain_error(
                &ctx,
                &err_tx,
                RuntimeError::StateType {
                    key: WINDOW_INPUTS_KEY,
                    expected: "tuple list",
                },
            ),
            Ok(None) => debug!(op = %self.core.name, "restore window state, nothing"),
            Err(e) => warn!(op = %self.core.name, "restore window state fails: {e}"),
        }

        let mut trigger_time = now_millis();
        match ctx.get_state(TRIGGER_TIME_KEY) {
            Ok(Some(StateValue::Int(restored))) => trigger_time = restored,
            Ok(Some(_)) => drain_error(
                &ctx,
                &err_tx,
                RuntimeError::StateType {
                    key: TRIGGER_TIME_KEY,
                    expected: "int64",
                },
            ),
            Ok(None) => {}
            Err(e) => warn!(op = %self.core.name, "restore trigger time fails: {e}"),
        }

        let mut msg_count: u64 = 0;
        match ctx.get_state(MSG_COUNT_KEY) {
            Ok(Some(StateValue::Count(restored))) => msg_count = restored,
            Ok(Some(_)) => drain_error(
                &ctx,
                &err_tx,
                RuntimeError::StateType {
                    key: MSG_COUNT_KEY,
                    expected: "count",
                },
            ),
            Ok(None) => {}
            Err(e) => warn!(op = %self.core.name, "restore message count fails: {e}"),
        }
        info!(
            op = %self.core.name,
            trigger_time,
            msg_count,
            "start with window state"
        );

        let interval_ms = match self.spec.window_type {
            WindowType::None => 0,
            WindowType::Tumbling => self.spec.length,
            WindowType::Hopping => self.spec.interval,
            WindowType::Sliding => self.spec.length,
            WindowType::Session => self.spec.interval,
            WindowType::Count => self.spec.interval,
        };

        let task = WindowTask {
            name: self.core.name.clone(),
            spec: self.spec,
            interval_ms,
            is_event_time: self.is_event_time,
            send_error: self.core.send_error,
            outputs: self.core.outputs.clone(),
            input_tx: self.core.input_tx.clone(),
            handler: self.barrier_handler.take(),
            stats,
            trigger_time,
            msg_count,
        };
        tokio::spawn(task.run(input_rx, inputs, ctx, err_tx));
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

struct WindowTask {
    name: Arc<str>,
    spec: WindowSpec,
    interval_ms: i64,
    is_event_time: bool,
    send_error: bool,
    outputs: HashMap<String, mpsc::Sender<Envelope>>,
    input_tx: mpsc::Sender<Envelope>,
    handler: Option<Box<dyn BarrierHandler>>,
    stats: StatManager,
    trigger_time: i64,
    msg_count: u64,
}

impl WindowTask {
    async fn run(
        mut self,
        mut input: mpsc::Receiver<Envelope>,
        mut inputs: Vec<SharedTuple>,
        ctx: StreamContext,
        err_tx: mpsc::Sender<RuntimeError>,
    ) {
        let mut ticker = match self.spec.window_type {
            WindowType::Tumbling => Some(tokio::time::interval(Duration::from_millis(
                self.spec.length as u64,
            ))),
            WindowType::Hopping => Some(tokio::time::interval(Duration::from_millis(
                self.spec.interval as u64,
            ))),
            WindowType::Session => Some(tokio::time::interval(Duration::from_millis(
                self.spec.length as u64,
            ))),
            _ => None,
        };
        if let Some(t) = ticker.as_mut() {
            // Consume the immediate first tick so the period starts now.
            t.tick().await;
            inputs = self.resume(inputs, &ctx).await;
        }

        // One-shot session timeout, rearmed on every tuple. `timer_created`
        // mirrors whether a session is open; a fired timer stays created
        // until it fires over a nonempty buffer.
        let mut timer_created = false;
        let mut timeout_at: Option<Instant> = None;

        loop {
            tokio::select! {
                received = input.recv() => {
                    let Some(env) = received else {
                        info!(op = %self.name, "window input channel closed");
                        return;
                    };
                    let env = match self.handler.as_mut() {
                        Some(handler) => match handler.process(env, &ctx) {
                            Some(env) => env,
                            None => continue,
                        },
                        None => env,
                    };
                    self.stats.inc_records_in();
                    self.stats.process_time_start();
                    match env.payload {
                        Payload::Error(msg) => {
                            if self.send_error
                                && broadcast(
                                    &self.outputs,
                                    &ctx,
                                    Envelope::error(msg, self.name.clone()),
                                )
                                .await
                                .is_err()
                            {
                                return;
                            }
                            self.stats.inc_exceptions();
                        }
                        Payload::Tuple(tuple) => {
                            debug!(op = %self.name, timestamp = tuple.timestamp, "window receives tuple");
                            let ts = tuple.timestamp;
                            inputs.push(tuple);
                            match self.spec.window_type {
                                WindowType::None | WindowType::Sliding => {
                                    inputs = self.scan(std::mem::take(&mut inputs), ts, &ctx).await.0;
                                }
                                WindowType::Session => {
                                    let deadline = Instant::now()
                                        + Duration::from_millis(self.spec.interval as u64);
                                    if timer_created {
                                        timeout_at = Some(deadline);
                                    } else {
                                        timer_created = true;
                                        timeout_at = Some(deadline);
                                        self.trigger_time = ts;
                                        self.persist_trigger_time(&ctx);
                                        debug!(op = %self.name, start = ts, "session window set start time");
                                    }
                                }
                                WindowType::Count => {
                                    self.msg_count += 1;
                                    debug!(op = %self.name, msg_count = self.msg_count, "count window");
                                    if self.msg_count % self.spec.interval as u64 != 0 {
                                        continue;
                                    }
                                    self.msg_count = 0;
                                    match TupleList::new(
                                        std::mem::take(&mut inputs),
                                        self.spec.length,
                                    ) {
                                        Ok(mut list) => {
                                            debug!(op = %self.name, windows = list.count(), "count windows ready");
                                            while list.has_more_count_window() {
                                                let results = list.next_count_window();
                                                let env = Envelope::new(
                                                    Payload::WindowResult(results),
                                                    self.name.clone(),
                                                );
                                                if broadcast(&self.outputs, &ctx, env).await.is_err() {
                                                    return;
                                                }
                                                self.stats.inc_records_out();
                                            }
                                            inputs = list.rest_tuples();
                                        }
                                        Err(e) => {
                                            error!(op = %self.name, "count window error: {e}");
                                            drain_error(&ctx, &err_tx, e);
                                        }
                                    }
                                }
                                WindowType::Tumbling | WindowType::Hopping => {}
                            }
                            self.stats.process_time_end();
                            let queued = self.input_tx.max_capacity() - self.input_tx.capacity();
                            self.stats.set_buffer_length(queued as i64);
                            self.persist_inputs(&ctx, &inputs);
                            self.persist_msg_count(&ctx);
                        }
                        other => {
                            let msg = format!(
                                "run Window error: expect tuple type but got {other:?}"
                            );
                            if self.send_error
                                && broadcast(
                                    &self.outputs,
                                    &ctx,
                                    Envelope::error(msg, self.name.clone()),
                                )
                                .await
                                .is_err()
                            {
                                return;
                            }
                            self.stats.inc_exceptions();
                        }
                    }
                }
                _ = tick(&mut ticker) => {
                    let n = now_millis();
                    if self.spec.window_type == WindowType::Session {
                        debug!(op = %self.name, at = n, buffered = inputs.len(), "session window ticker");
                        if inputs.is_empty() || n - self.spec.length < inputs[0].timestamp {
                            if !inputs.is_empty() {
                                debug!(
                                    op = %self.name,
                                    cutoff = n - self.spec.length,
                                    first = inputs[0].timestamp,
                                    "session still active"
                                );
                            }
                            continue;
                        }
                    }
                    if !inputs.is_empty() {
                        self.stats.process_time_start();
                        debug!(op = %self.name, at = n, "triggered by ticker");
                        inputs = self.scan(std::mem::take(&mut inputs), n, &ctx).await.0;
                        self.stats.process_time_end();
                        self.persist_inputs(&ctx, &inputs);
                        self.persist_trigger_time(&ctx);
                    }
                }
                _ = sleep_until(timeout_at) => {
                    if !inputs.is_empty() {
                        self.stats.process_time_start();
                        debug!(op = %self.name, "triggered by timeout");
                        self.scan(std::mem::take(&mut inputs), now_millis(), &ctx).await;
                        // Expire everything so the next ticker finds nothing.
                        inputs = Vec::new();
                        self.stats.process_time_end();
                        self.persist_inputs(&ctx, &inputs);
                        self.persist_trigger_time(&ctx);
                        timer_created = false;
                    }
                    timeout_at = None;
                }
                _ = ctx.cancelled() => {
                    info!(op = %self.name, "cancelling window....");
                    return;
                }
            }
        }
    }

    /// Replay windows that would have triggered between the restored
    /// trigger time and the first upcoming tick.
    async fn resume(&mut self, mut inputs: Vec<SharedTuple>, ctx: &StreamContext) -> Vec<SharedTuple> {
        if inputs.is_empty() || self.trigger_time <= 0 {
            return inputs;
        }
        let next_tick = now_millis() + self.interval_ms;
        match self.spec.window_type {
            WindowType::Tumbling | WindowType::Hopping => {
                let mut next = self.trigger_time;
                loop {
                    next += self.interval_ms;
                    if next > next_tick {
                        break;
                    }
                    debug!(op = %self.name, at = next, "triggered by restore inputs");
                    inputs = self.scan(std::mem::take(&mut inputs), next, ctx).await.0;
                    self.persist_inputs(ctx, &inputs);
                    self.persist_trigger_time(ctx);
                }
            }
            WindowType::Session => {
                let timeout = self.spec.interval;
                let duration = self.spec.length;
                loop {
                    let Some(next) = session_boundary(&inputs, timeout, duration) else {
                        break;
                    };
                    if next > next_tick {
                        break;
                    }
                    debug!(op = %self.name, at = next, "triggered by restore inputs");
                    inputs = self.scan(std::mem::take(&mut inputs), next, ctx).await.0;
                    self.persist_inputs(ctx, &inputs);
                    self.persist_trigger_time(ctx);
                }
            }
            _ => {}
        }
        inputs
    }

    /// Partition the buffer at `trigger_time`: emit everything at or before
    /// it, retain future tuples (or, for hopping/sliding, tuples still
    /// inside the window length plus scheduling delta), drop the rest.
    async fn scan(
        &mut self,
        mut inputs: Vec<SharedTuple>,
        trigger_time: i64,
        ctx: &StreamContext,
    ) -> (Vec<SharedTuple>, bool) {
        debug!(op = %self.name, at = trigger_time, "window triggered");
        let overlapping = matches!(
            self.spec.window_type,
            WindowType::Hopping | WindowType::Sliding
        );
        let delta = if overlapping {
            self.cal_delta(trigger_time)
        } else {
            0
        };
        let mut results = WindowResultSet::new(0, trigger_time);
        let mut kept = 0;
        for i in 0..inputs.len() {
            let tuple = inputs[i].clone();
            if overlapping {
                let diff = trigger_time - tuple.timestamp;
                if diff > self.spec.length + delta {
                    debug!(
                        op = %self.name,
                        timestamp = tuple.timestamp,
                        diff,
                        delta,
                        "expired tuple dropped"
                    );
                    continue;
                }
                inputs[kept] = tuple.clone();
                kept += 1;
            } else if tuple.timestamp > trigger_time {
                inputs[kept] = tuple.clone();
                kept += 1;
            }
            if tuple.timestamp <= trigger_time {
                results.push(tuple);
            }
        }
        inputs.truncate(kept);

        let mut triggered = false;
        if !results.is_empty() {
            results.window_start = match self.spec.window_type {
                WindowType::Hopping => self.trigger_time - self.spec.interval,
                WindowType::Sliding => trigger_time - self.spec.length,
                _ => self.trigger_time,
            };
            debug!(op = %self.name, count = results.len(), "window emits");
            if self.is_event_time {
                results.sort_by_timestamp();
            }
            let env = Envelope::new(Payload::WindowResult(results), self.name.clone());
            if broadcast(&self.outputs, ctx, env).await.is_err() {
                return (inputs, false);
            }
            triggered = true;
            self.trigger_time = trigger_time;
            self.stats.inc_records_out();
            debug!(op = %self.name, "done scan");
        }
        (inputs, triggered)
    }

    /// Scheduling slack for hopping/sliding eviction. The first trigger
    /// uses a large sentinel so every buffered tuple is in scope.
    fn cal_delta(&self, trigger_time: i64) -> i64 {
        let last_trigger_time = self.trigger_time;
        if last_trigger_time <= 0 {
            i64::from(i16::MAX)
        } else if !self.is_event_time && self.spec.interval > 0 {
            let delta = trigger_time - last_trigger_time - self.spec.interval;
            if delta > 100 {
                warn!(
                    op = %self.name,
                    previous = last_trigger_time,
                    current = trigger_time,
                    "possible long computation in window"
                );
            }
            delta
        } else {
            0
        }
    }

    fn persist_inputs(&self, ctx: &StreamContext, inputs: &[SharedTuple]) {
        let owned: Vec<Tuple> = inputs.iter().map(|t| (**t).clone()).collect();
        if let Err(e) = ctx.put_state(WINDOW_INPUTS_KEY, StateValue::Tuples(owned)) {
            warn!(op = %self.name, "persist window inputs fails: {e}");
        }
    }

    fn persist_trigger_time(&self, ctx: &StreamContext) {
        if let Err(e) = ctx.put_state(TRIGGER_TIME_KEY, StateValue::Int(self.trigger_time)) {
            warn!(op = %self.name, "persist trigger time fails: {e}");
        }
    }

    fn persist_msg_count(&self, ctx: &StreamContext) {
        if let Err(e) = ctx.put_state(MSG_COUNT_KEY, StateValue::Count(self.msg_count)) {
            warn!(op = %self.name, "persist message count fails: {e}");
        }
    }
}

/// Resolve a ticker that only some flavors carry.
async fn tick(ticker: &mut Option<tokio::time::Interval>) -> Instant {
    match ticker.as_mut() {
        Some(t) => t.tick().await,
        None => std::future::pending().await,
    }
}

/// Resolve a one-shot timeout that may be disarmed.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Next session-window boundary inside the restored buffer: either a gap
/// longer than the session timeout, or a duration tick past the first
/// tuple. `None` when the buffer holds a single uninterrupted session.
fn session_boundary(inputs: &[SharedTuple], timeout: i64, duration: i64) -> Option<i64> {
    let first = inputs.first()?;
    let et = first.timestamp;
    let mut tick = if et % duration == 0 {
        et
    } else {
        et + (duration - et % duration)
    };
    let mut prev: i64 = 0;
    for tuple in inputs {
        let mut boundary = i64::MAX;
        if prev > 0 && tuple.timestamp - prev > timeout {
            boundary = prev + timeout;
        }
        if tuple.timestamp > tick {
            if tick - duration > et && tick < boundary {
                boundary = tick;
            }
            tick += duration;
        }
        if boundary < i64::MAX {
            return Some(boundary);
        }
        prev = tuple.timestamp;
    }
    None
}

/// Count-window view over the buffer. One window emits per trigger even if
/// several are ready: `has_more_count_window` is gated on the iteration
/// index, so a fill only ever yields its newest window.
pub(crate) struct TupleList {
    tuples: Vec<SharedTuple>,
    index: usize,
    size: usize,
}

impl TupleList {
    pub fn new(tuples: Vec<SharedTuple>, window_size: i64) -> Result<Self, RuntimeError> {
        if window_size <= 0 {
            return Err(RuntimeError::Operation(
                "window size should not be less than zero".into(),
            ));
        }
        if tuples.is_empty() {
            return Err(RuntimeError::Operation(
                "the tuples should not be nil or empty".into(),
            ));
        }
        Ok(Self {
            tuples,
            index: 0,
            size: window_size as usize,
        })
    }

    pub fn has_more_count_window(&self) -> bool {
        self.tuples.len() >= self.size && self.index == 0
    }

    pub fn count(&self) -> usize {
        if self.tuples.len() < self.size {
            0
        } else {
            1
        }
    }

    /// Emit the last `size` tuples as one window.
    pub fn next_count_window(&mut self) -> WindowResultSet {
        let mut results = WindowResultSet::default();
        let start = self.tuples.len() - self.size;
        results.content.extend(self.tuples[start..].iter().cloned());
        self.index += 1;
        results
    }

    /// Tuples surviving the emission: the last `size - 1`, so consecutive
    /// count windows overlap by all but the evicted oldest tuple.
    pub fn rest_tuples(&self) -> Vec<SharedTuple> {
        if self.tuples.len() < self.size {
            self.tuples.clone()
        } else {
            self.tuples[self.tuples.len() - self.size + 1..].to_vec()
        }
    }
}
