//! Weir Core - Shared types for the Weir stream engine
//!
//! This crate provides the value model and the rule/window options that the
//! planner hands to the runtime.

pub mod options;
pub mod value;

pub use options::{Qos, RuleOptions, WindowSpec, WindowType};
pub use value::Value;
