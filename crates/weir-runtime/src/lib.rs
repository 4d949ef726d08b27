//! Weir Runtime - Dataflow execution core
//!
//! A rule is an acyclic graph of operators joined by bounded channels that
//! carry [`Envelope`]s: tuples, window results, errors, and checkpoint
//! barriers. This crate hosts the operator envelopes, the window operator,
//! the barrier handlers, and the orchestration that wires them together.

pub mod checkpoint;
pub mod context;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod operator;
pub mod source;
pub mod state;
pub mod topology;
pub mod tuple;

pub use context::StreamContext;
pub use envelope::{Barrier, Envelope, Payload, WindowResultSet};
pub use error::RuntimeError;
pub use metrics::{Metrics, OpMetrics, StatManager};
pub use source::SourcePool;
pub use state::{create_store, MemoryStore, RedbStore, StateStore, StateValue, StoreError};
pub use topology::{Rule, RuleHandle};
pub use tuple::{now_millis, SharedTuple, Tuple};
