//! Envelopes: the unit of flow on every operator-to-operator channel.
//!
//! Every channel in a rule carries [`Envelope`]s. The payload is a tagged
//! variant over the closed set of things an operator can receive: a tuple,
//! a window result, a join or grouped result, a user error, or a checkpoint
//! [`Barrier`]. Barriers travel in-band on the same channels as tuples, so
//! per-channel ordering between data and barriers is preserved end-to-end.

use crate::tuple::SharedTuple;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// In-band marker instructing downstream operators to snapshot state.
///
/// Produced only by sources at the request of the checkpoint coordinator.
/// On any one channel, `checkpoint_id` is monotonically nondecreasing;
/// different channels may observe the same id at different wall times.
/// `op_id` names the upstream operator (the channel) the barrier arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: i64,
    pub op_id: String,
}

impl Barrier {
    pub fn new(checkpoint_id: i64, op_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id,
            op_id: op_id.into(),
        }
    }
}

/// An ordered batch of tuples emitted by a window trigger.
///
/// `window_start`/`window_end` are event-time milliseconds; count windows
/// leave them at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowResultSet {
    pub content: Vec<SharedTuple>,
    pub window_start: i64,
    pub window_end: i64,
}

impl WindowResultSet {
    pub fn new(window_start: i64, window_end: i64) -> Self {
        Self {
            content: Vec::new(),
            window_start,
            window_end,
        }
    }

    pub fn push(&mut self, tuple: SharedTuple) {
        self.content.push(tuple);
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Stable sort by event timestamp, used in event-time mode.
    pub fn sort_by_timestamp(&mut self) {
        self.content.sort_by_key(|t| t.timestamp);
    }
}

/// One row of a join result: the matched tuples, one per joined stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRow {
    pub tuples: Vec<SharedTuple>,
}

/// The output of a join operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinResultSet {
    pub rows: Vec<JoinRow>,
}

/// One group produced by an aggregate operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub key: String,
    pub content: Vec<SharedTuple>,
}

/// The output of a grouping operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupedResultSet {
    pub groups: Vec<Group>,
}

/// Tagged payload variant carried by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Tuple(SharedTuple),
    WindowResult(WindowResultSet),
    JoinSet(JoinResultSet),
    GroupedSet(GroupedResultSet),
    Error(String),
    Barrier(Barrier),
}

impl Payload {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Payload::Barrier(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error(_))
    }

    pub fn as_barrier(&self) -> Option<&Barrier> {
        match self {
            Payload::Barrier(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&SharedTuple> {
        match self {
            Payload::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_window_result(&self) -> Option<&WindowResultSet> {
        match self {
            Payload::WindowResult(w) => Some(w),
            _ => None,
        }
    }
}

/// Wire-level unit flowing on operator channels.
///
/// `channel_id` identifies the upstream edge the envelope arrived on; every
/// operator stamps its own name on the envelopes it emits. Envelopes are
/// single-owner: producers relinquish on send, consumers own on receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    pub channel_id: Arc<str>,
}

impl Envelope {
    pub fn new(payload: Payload, channel_id: impl Into<Arc<str>>) -> Self {
        Self {
            payload,
            channel_id: channel_id.into(),
        }
    }

    pub fn tuple(tuple: SharedTuple, channel_id: impl Into<Arc<str>>) -> Self {
        Self::new(Payload::Tuple(tuple), channel_id)
    }

    pub fn barrier(barrier: Barrier, channel_id: impl Into<Arc<str>>) -> Self {
        Self::new(Payload::Barrier(barrier), channel_id)
    }

    pub fn error(message: impl Into<String>, channel_id: impl Into<Arc<str>>) -> Self {
        Self::new(Payload::Error(message.into()), channel_id)
    }
}
