//! Stream context: the immutable per-operator execution environment.
//!
//! A context carries the rule id, operator id, instance id, the rule's state
//! store, and a cancellation token. Derivations (`with_op`, `with_instance`,
//! `with_cancel`) clone the record; nothing is ambient process state. Cloning
//! is cheap: ids are `Arc<str>` and the store is shared.

use crate::state::{StateStore, StateValue, StoreError};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Clone)]
pub struct StreamContext {
    rule_id: Arc<str>,
    op_id: Arc<str>,
    instance_id: usize,
    store: Arc<dyn StateStore>,
    cancellation: CancellationToken,
}

impl StreamContext {
    /// Root context for a rule. Operators derive their own via `with_op`.
    pub fn new(rule_id: impl Into<Arc<str>>, store: Arc<dyn StateStore>) -> Self {
        Self {
            rule_id: rule_id.into(),
            op_id: Arc::from(""),
            instance_id: 0,
            store,
            cancellation: CancellationToken::new(),
        }
    }

    /// Rebind rule, operator, and store in one step.
    pub fn with_meta(
        &self,
        rule_id: impl Into<Arc<str>>,
        op_id: impl Into<Arc<str>>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            op_id: op_id.into(),
            instance_id: self.instance_id,
            store,
            cancellation: self.cancellation.clone(),
        }
    }

    pub fn with_op(&self, op_id: impl Into<Arc<str>>) -> Self {
        Self {
            op_id: op_id.into(),
            ..self.clone()
        }
    }

    pub fn with_instance(&self, instance_id: usize) -> Self {
        Self {
            instance_id,
            ..self.clone()
        }
    }

    /// Derive a child context whose cancellation can be triggered
    /// independently; cancelling the parent still cancels the child.
    pub fn with_cancel(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Cancel this context (and every child derived from it).
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when this context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Operator-scoped store key. The store itself is per rule, so state
    /// only needs to be disambiguated by operator.
    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.op_id, key)
    }

    pub fn put_state(&self, key: &str, value: StateValue) -> Result<(), StoreError> {
        self.store.put(&self.scoped(key), value)
    }

    pub fn get_state(&self, key: &str) -> Result<Option<StateValue>, StoreError> {
        self.store.get(&self.scoped(key))
    }

    pub fn delete_state(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&self.scoped(key))
    }
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("rule_id", &self.rule_id)
            .field("op_id", &self.op_id)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
