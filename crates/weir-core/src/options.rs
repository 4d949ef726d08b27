//! Rule and window options handed to the runtime by the planner.

use serde::{Deserialize, Serialize};

/// Checkpointing quality of service for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// No checkpointing.
    AtMostOnce,
    /// Barrier tracking, durable state.
    #[default]
    AtLeastOnce,
    /// Barrier alignment, durable state.
    ExactlyOnce,
}

/// Window flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// No windowing, trigger per tuple.
    #[default]
    None,
    Tumbling,
    Hopping,
    Sliding,
    Session,
    Count,
}

/// Error raised for an inconsistent window or rule configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("window length must be greater than zero, got {0}")]
    InvalidLength(i64),
    #[error("hopping window interval must be in (0, length), got interval {interval} length {length}")]
    InvalidHop { interval: i64, length: i64 },
}

/// A parsed window configuration.
///
/// `length` and `interval` are milliseconds for time windows and tuple counts
/// for count windows. Session windows use `length` as the session gap and
/// `interval` as the clock resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub window_type: WindowType,
    pub length: i64,
    #[serde(default)]
    pub interval: i64,
}

impl WindowSpec {
    pub fn new(window_type: WindowType, length: i64, interval: i64) -> Self {
        Self {
            window_type,
            length,
            interval,
        }
    }

    /// Apply defaults: a count window with no interval emits every `length`
    /// tuples; a tumbling window always hops by its own length.
    pub fn normalize(mut self) -> Self {
        match self.window_type {
            WindowType::Count if self.interval == 0 => self.interval = self.length,
            WindowType::Tumbling => self.interval = self.length,
            _ => {}
        }
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.window_type == WindowType::None {
            return Ok(());
        }
        if self.length <= 0 {
            return Err(OptionsError::InvalidLength(self.length));
        }
        if self.window_type == WindowType::Hopping
            && (self.interval <= 0 || self.interval >= self.length)
        {
            return Err(OptionsError::InvalidHop {
                interval: self.interval,
                length: self.length,
            });
        }
        Ok(())
    }
}

/// Per-rule execution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOptions {
    /// Checkpointing level.
    pub qos: Qos,
    /// Capacity of every operator-to-operator channel.
    pub buffer_length: usize,
    /// Scheduling tasks per unary operator.
    pub concurrency: usize,
    /// Trigger windows on event time instead of processing time.
    pub is_event_time: bool,
    /// Tolerated event-time lateness in milliseconds.
    pub late_tolerance_ms: i64,
    /// Forward user errors downstream as error envelopes.
    pub send_error: bool,
    /// Interval between checkpoint barriers in milliseconds.
    pub checkpoint_interval_ms: u64,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            qos: Qos::AtLeastOnce,
            buffer_length: 1024,
            concurrency: 1,
            is_event_time: false,
            late_tolerance_ms: 0,
            send_error: true,
            checkpoint_interval_ms: 60_000,
        }
    }
}
