//! Runtime error taxonomy.

use crate::state::StoreError;

/// Errors surfaced by operators and the rule runtime.
///
/// Structural errors (`NoOutput`, stat-manager creation) abort operator
/// start-up and are drained to the rule-wide error channel. Data errors are
/// surfaced downstream as error envelopes and processing continues.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Operator was started without a downstream channel.
    #[error("operator {0}: no output channel found")]
    NoOutput(String),

    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Restored state has an unexpected type under a well-known key.
    #[error("restore state `{key}` error, invalid type, expected {expected}")]
    StateType {
        key: &'static str,
        expected: &'static str,
    },

    /// A required channel was closed.
    #[error("channel {0} closed")]
    ChannelClosed(String),

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// User operation or window bookkeeping failure.
    #[error("{0}")]
    Operation(String),

    /// The rule was cancelled while the operation was in flight.
    #[error("cancelled")]
    Cancelled,
}
