//! End-to-end window operator tests: tickers, timeouts, and recovery.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use weir_core::{Qos, RuleOptions, WindowSpec, WindowType};
use weir_runtime::operator::{Operator, WindowOperator};
use weir_runtime::state::{StateStore, TRIGGER_TIME_KEY, WINDOW_INPUTS_KEY};
use weir_runtime::{
    Envelope, MemoryStore, Metrics, RuntimeError, StateValue, StreamContext, Tuple,
    WindowResultSet,
};

fn options() -> RuleOptions {
    RuleOptions {
        qos: Qos::AtMostOnce,
        buffer_length: 64,
        ..RuleOptions::default()
    }
}

struct RunningWindow {
    input: mpsc::Sender<Envelope>,
    sink: mpsc::Receiver<Envelope>,
    ctx: StreamContext,
    // Kept alive so operator-held channel ends survive the test body.
    _op: WindowOperator,
}

fn start_window(spec: WindowSpec, store: Arc<dyn StateStore>) -> RunningWindow {
    let mut op = WindowOperator::new("window", spec, &options(), Metrics::new()).unwrap();
    let (sink_tx, sink_rx) = mpsc::channel(32);
    op.add_output("sink", sink_tx);
    let (err_tx, _err_rx) = mpsc::channel(8);
    let ctx = StreamContext::new("rule1", store);
    let input = op.input();
    op.exec(ctx.clone(), err_tx);
    RunningWindow {
        input,
        sink: sink_rx,
        ctx,
        _op: op,
    }
}

async fn send_tuple(input: &mpsc::Sender<Envelope>, ts: i64) {
    input
        .send(Envelope::tuple(Tuple::new_at("demo", ts).shared(), "demo"))
        .await
        .unwrap();
}

async fn recv_window(sink: &mut mpsc::Receiver<Envelope>) -> WindowResultSet {
    let env = timeout(Duration::from_secs(2), sink.recv())
        .await
        .expect("window emission expected")
        .expect("channel open");
    env.payload
        .as_window_result()
        .expect("window result payload")
        .clone()
}

fn timestamps(results: &WindowResultSet) -> Vec<i64> {
    results.content.iter().map(|t| t.timestamp).collect()
}

#[tokio::test(start_paused = true)]
async fn test_tumbling_window_emits_on_ticker() {
    let spec = WindowSpec::new(WindowType::Tumbling, 100, 0);
    let mut w = start_window(spec, Arc::new(MemoryStore::new()));

    let now = weir_runtime::now_millis();
    for ts in [now - 30, now - 20, now - 10] {
        send_tuple(&w.input, ts).await;
    }

    // Advance past one window length; the ticker fires and scans.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let results = recv_window(&mut w.sink).await;
    assert_eq!(results.len(), 3);
    assert!(results.window_end >= now - 10);

    // Nothing left: the next tick has nothing to emit.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(w.sink.try_recv().is_err());

    w.ctx.cancel();
}

#[tokio::test]
async fn test_count_window_emits_every_interval() {
    // Scenario: length 3, interval 2. After t2 nothing; after t4 the last
    // three; after t6 the next three (overlap by one).
    let spec = WindowSpec::new(WindowType::Count, 3, 2);
    let mut w = start_window(spec, Arc::new(MemoryStore::new()));

    for ts in 1..=4 {
        send_tuple(&w.input, ts).await;
    }
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![2, 3, 4]);

    for ts in 5..=6 {
        send_tuple(&w.input, ts).await;
    }
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![4, 5, 6]);

    w.ctx.cancel();
}

#[tokio::test]
async fn test_count_window_persists_progress(){
    let store = Arc::new(MemoryStore::new());
    let spec = WindowSpec::new(WindowType::Count, 3, 2);
    let mut w = start_window(spec, store.clone());

    send_tuple(&w.input, 1).await;
    send_tuple(&w.input, 2).await;
    // interval not reached: nothing emitted, but inputs are persisted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(w.sink.try_recv().is_err());

    let scoped = w.ctx.with_op("window");
    match scoped.get_state(WINDOW_INPUTS_KEY).unwrap() {
        Some(StateValue::Tuples(tuples)) => assert_eq!(tuples.len(), 2),
        other => panic!("unexpected window inputs state: {other:?}"),
    }

    w.ctx.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_sliding_window_triggers_per_tuple() {
    let spec = WindowSpec::new(WindowType::Sliding, 1_000, 0);
    let mut w = start_window(spec, Arc::new(MemoryStore::new()));

    send_tuple(&w.input, 1_000).await;
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![1_000]);

    send_tuple(&w.input, 1_500).await;
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![1_000, 1_500]);
    assert_eq!(results.window_start, 500);

    // A much later tuple expires the earlier ones.
    send_tuple(&w.input, 9_000).await;
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![9_000]);

    w.ctx.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_session_window_times_out_and_restarts() {
    // Gap timeout (interval) 100 ms; long session cap so only the
    // timeout path fires.
    let spec = WindowSpec::new(WindowType::Session, 3_600_000, 100);
    let mut w = start_window(spec, Arc::new(MemoryStore::new()));

    for ts in [1, 2, 3] {
        send_tuple(&w.input, ts).await;
    }
    // No emission while tuples keep arriving within the gap.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(w.sink.try_recv().is_err());

    // Let the gap elapse: the session closes with everything buffered.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![1, 2, 3]);
    // Session start is the first tuple's timestamp.
    assert_eq!(results.window_start, 1);

    // A fresh session opens with the next tuple.
    send_tuple(&w.input, 10).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    let results = recv_window(&mut w.sink).await;
    assert_eq!(timestamps(&results), vec![10]);
    assert_eq!(results.window_start, 10);

    w.ctx.cancel();
}

#[tokio::test]
async fn test_tumbling_window_replays_after_restart() {
    let store = Arc::new(MemoryStore::new());
    let spec = WindowSpec::new(WindowType::Tumbling, 100, 0);

    // First incarnation buffers two tuples, then the rule dies before the
    // ticker fires.
    {
        let w = start_window(spec, store.clone());
        let now = weir_runtime::now_millis();
        send_tuple(&w.input, now - 5).await;
        send_tuple(&w.input, now - 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.ctx.cancel();
    }

    // Pretend the outage lasted several window lengths.
    {
        let seed = StreamContext::new("rule1", store.clone()).with_op("window");
        seed.put_state(
            TRIGGER_TIME_KEY,
            StateValue::Int(weir_runtime::now_millis() - 1_000),
        )
        .unwrap();
    }

    // The restarted operator replays the elapsed window from restored
    // state and emits the buffered tuples.
    let mut w = start_window(spec, store);
    let results = recv_window(&mut w.sink).await;
    assert_eq!(results.len(), 2);

    w.ctx.cancel();
}

#[tokio::test]
async fn test_restore_type_mismatch_surfaces_and_continues() {
    let store = Arc::new(MemoryStore::new());
    {
        let seed = StreamContext::new("rule1", store.clone()).with_op("window");
        seed.put_state(WINDOW_INPUTS_KEY, StateValue::Int(42)).unwrap();
    }

    let mut op = WindowOperator::new(
        "window",
        WindowSpec::new(WindowType::Count, 3, 2),
        &options(),
        Metrics::new(),
    )
    .unwrap();
    let (sink_tx, mut sink_rx) = mpsc::channel(32);
    op.add_output("sink", sink_tx);
    let (err_tx, mut err_rx) = mpsc::channel(8);
    let ctx = StreamContext::new("rule1", store);
    let input = op.input();
    op.exec(ctx.clone(), err_tx);

    // The mismatch is reported as a structural error...
    let err = timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        err,
        RuntimeError::StateType { key, .. } if key == WINDOW_INPUTS_KEY
    ));

    // ...and the operator still runs with default state: four tuples fill
    // a length-3 window on the second interval.
    for ts in 1..=4 {
        send_tuple(&input, ts).await;
    }
    let env = timeout(Duration::from_secs(2), sink_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let results = env.payload.as_window_result().unwrap();
    assert_eq!(results.content.len(), 3);

    ctx.cancel();
}
