//! Source pool: multiplexes one shared source instance across rules.
//!
//! A physical source adapter (a collaborator) registers its output
//! channels here under a pool key (`"{type}.{name}"`). Multiple rules can
//! subscribe to the same key; the pool keeps one entry per key with a
//! reference count, and the owning source task fans envelopes out to every
//! subscriber. Detaching the last subscriber drops the entry.

use crate::envelope::Envelope;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct PooledSource {
    outputs: HashMap<String, mpsc::Sender<Envelope>>,
    refs: usize,
}

/// Per-bundle registry of shared source instances. Constructed explicitly
/// with the bundle, never process-global.
#[derive(Default)]
pub struct SourcePool {
    registry: Mutex<FxHashMap<String, PooledSource>>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `subscriber_id` to the source under `key`, creating the
    /// pool entry on first use. Returns true when this call created the
    /// entry, i.e. the caller must also start the physical source.
    pub fn attach(
        &self,
        key: &str,
        subscriber_id: &str,
        output: mpsc::Sender<Envelope>,
    ) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.get_mut(key) {
            Some(entry) => {
                entry.outputs.insert(subscriber_id.to_string(), output);
                entry.refs += 1;
                debug!(key, subscriber_id, refs = entry.refs, "attached to pooled source");
                false
            }
            None => {
                let mut outputs = HashMap::new();
                outputs.insert(subscriber_id.to_string(), output);
                registry.insert(key.to_string(), PooledSource { outputs, refs: 1 });
                debug!(key, subscriber_id, "created pooled source");
                true
            }
        }
    }

    /// Drop `subscriber_id` from the source under `key`. Returns true when
    /// the last subscriber left and the physical source should stop.
    pub fn detach(&self, key: &str, subscriber_id: &str) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = registry.get_mut(key) else {
            return false;
        };
        entry.outputs.remove(subscriber_id);
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            registry.remove(key);
            debug!(key, "removed pooled source");
            true
        } else {
            false
        }
    }

    /// Fan an envelope out to every subscriber of `key`. Drops the
    /// envelope per subscriber whose channel is full; a pooled source
    /// must not let one slow rule stall the others.
    pub fn broadcast(&self, key: &str, env: &Envelope) {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = registry.get(key) else {
            return;
        };
        for (subscriber, tx) in &entry.outputs {
            if let Err(e) = tx.try_send(env.clone()) {
                warn!(key, subscriber, "pooled source send failed: {e}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscribers on one key.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|entry| entry.outputs.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Tuple;

    #[test]
    fn test_attach_detach_refcounting() {
        let pool = SourcePool::new();
        let (tx, _rx) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let (tx3, _rx3) = mpsc::channel(4);

        assert!(pool.attach("mock.demo", "rule0.src", tx));
        assert!(!pool.attach("mock.demo", "rule1.src", tx2));
        assert!(!pool.attach("mock.demo", "rule2.src", tx3));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.subscriber_count("mock.demo"), 3);

        assert!(!pool.detach("mock.demo", "rule0.src"));
        assert!(!pool.detach("mock.demo", "rule1.src"));
        assert_eq!(pool.subscriber_count("mock.demo"), 1);
        // Last subscriber: the entry is dropped.
        assert!(pool.detach("mock.demo", "rule2.src"));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let pool = SourcePool::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        pool.attach("mock.demo", "a", tx1);
        pool.attach("mock.demo", "b", tx2);

        let env = Envelope::tuple(Tuple::new_at("demo", 1).shared(), "demo");
        pool.broadcast("mock.demo", &env);

        assert_eq!(rx1.recv().await, Some(env.clone()));
        assert_eq!(rx2.recv().await, Some(env));
    }

    #[test]
    fn test_detach_unknown_key_is_noop() {
        let pool = SourcePool::new();
        assert!(!pool.detach("mock.demo", "rule0.src"));
    }
}
