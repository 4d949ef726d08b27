//! Checkpoint barrier protocol.
//!
//! Barriers flow in-band through the same channels as tuples and induce
//! globally consistent snapshots across the operators of one rule. Two
//! handler variants implement the quality-of-service levels: the
//! [`BarrierTracker`] (at-least-once) counts barrier arrivals without ever
//! blocking data, and the [`BarrierAligner`] (exactly-once) blocks inputs
//! that have already delivered the current barrier until the rest catch up.
//!
//! Handlers are owned by exactly one scheduling task; their internal maps
//! are never shared.

mod aligner;
mod coordinator;
mod tracker;

pub use aligner::BarrierAligner;
pub use coordinator::{Ack, AckResponder, BarrierEmitter, Coordinator};
pub use tracker::BarrierTracker;

use crate::context::StreamContext;
use crate::envelope::Envelope;
use crate::error::RuntimeError;

/// Interface the handlers call back into when a snapshot is due.
pub trait Responder: Send {
    /// Take (or acknowledge) a snapshot for the given checkpoint id.
    fn trigger_checkpoint(&self, checkpoint_id: i64) -> Result<(), RuntimeError>;

    fn name(&self) -> &str;
}

/// In-band barrier handling, invoked by an operator on every received
/// envelope before any other processing.
///
/// Returns `None` when the envelope was consumed: it carried a barrier, or
/// the handler buffered it because its channel is blocked by an in-flight
/// alignment. Returns `Some(envelope)` to hand the envelope back to the
/// operator. Handlers never reorder pass-through envelopes.
pub trait BarrierHandler: Send {
    fn process(&mut self, data: Envelope, ctx: &StreamContext) -> Option<Envelope>;
}
