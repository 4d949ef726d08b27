//! Tuple types for the runtime

use chrono::Utc;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use weir_core::Value;

/// Type alias for field name keys using Arc<str> for O(1) cloning.
pub type FieldKey = Arc<str>;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of tuple fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to a Tuple for cheap fan-out across downstream
/// operators. Tuples are immutable after emission, so sharing is safe.
pub type SharedTuple = Arc<Tuple>;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A record flowing through a rule.
///
/// `emitter` names the logical stream the tuple entered the rule from.
/// `timestamp` is event-time milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub emitter: Arc<str>,
    pub message: FxIndexMap<FieldKey, Value>,
    #[serde(default)]
    pub metadata: FxIndexMap<FieldKey, Value>,
    pub timestamp: i64,
}

impl Tuple {
    pub fn new(emitter: impl Into<Arc<str>>) -> Self {
        Self {
            emitter: emitter.into(),
            message: IndexMap::with_hasher(FxBuildHasher),
            metadata: IndexMap::with_hasher(FxBuildHasher),
            timestamp: now_millis(),
        }
    }

    /// Creates a tuple with a specific event timestamp.
    pub fn new_at(emitter: impl Into<Arc<str>>, timestamp: i64) -> Self {
        Self {
            emitter: emitter.into(),
            message: IndexMap::with_hasher(FxBuildHasher),
            metadata: IndexMap::with_hasher(FxBuildHasher),
            timestamp,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: impl Into<FieldKey>, value: impl Into<Value>) -> Self {
        self.message.insert(key.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<FieldKey>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn shared(self) -> SharedTuple {
        Arc::new(self)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.message.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.message.get(key).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.message.get(key).and_then(|v| v.as_float())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.message.get(key).and_then(|v| v.as_str())
    }

    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Serialize for sink output: timestamp plus message fields, in field
    /// insertion order. The emitter is conveyed by the sink topic, so it
    /// is not repeated in the payload.
    pub fn to_sink_payload(&self) -> Vec<u8> {
        use serde::ser::SerializeMap;
        use serde::Serializer;
        let mut buf = Vec::with_capacity(256);
        let mut ser = serde_json::Serializer::new(&mut buf);
        let mut map = ser.serialize_map(Some(1 + self.message.len())).unwrap();
        map.serialize_entry("timestamp", &self.timestamp).unwrap();
        for (k, v) in &self.message {
            if k.as_ref() != "timestamp" {
                map.serialize_entry(k.as_ref(), &serde_json::Value::from(v))
                    .unwrap();
            }
        }
        map.end().unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_new() {
        let t = Tuple::new("demo");
        assert_eq!(&*t.emitter, "demo");
        assert!(t.message.is_empty());
        assert!(t.timestamp > 0);
    }

    #[test]
    fn test_tuple_builder() {
        let t = Tuple::new_at("demo", 1_000)
            .with_field("temperature", 20.5)
            .with_field("device", "sensor1")
            .with_meta("topic", "devices/sensor1");

        assert_eq!(t.timestamp, 1_000);
        assert_eq!(t.get_float("temperature"), Some(20.5));
        assert_eq!(t.get_str("device"), Some("sensor1"));
        assert_eq!(
            t.get_meta("topic"),
            Some(&Value::Str("devices/sensor1".into()))
        );
        assert_eq!(t.get("missing"), None);
    }

    #[test]
    fn test_tuple_int_float_coercion() {
        let t = Tuple::new("demo").with_field("count", 3i64).with_field("ratio", 2.9f64);
        assert_eq!(t.get_float("count"), Some(3.0));
        assert_eq!(t.get_int("ratio"), Some(2));
    }

    #[test]
    fn test_to_sink_payload() {
        let t = Tuple::new_at("demo", 42)
            .with_field("device", "sensor1")
            .with_field("value", 5i64);
        let payload = String::from_utf8(t.to_sink_payload()).unwrap();
        assert_eq!(payload, r#"{"timestamp":42,"device":"sensor1","value":5}"#);
    }

    #[test]
    fn test_tuple_serde_round_trip() {
        let t = Tuple::new_at("demo", 42)
            .with_field("a", 1i64)
            .with_meta("m", "x");
        let bytes = bincode::serialize(&t).unwrap();
        let restored: Tuple = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, t);
    }
}
