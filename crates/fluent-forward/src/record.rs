//! Ordered key-value record payloads.
//!
//! A [`Record`] is the map half of a `[timestamp, record]` event pair. Key
//! order is preserved so the bytes a collector sees match the order the
//! caller built the record in, which matters for deterministic wire output
//! and for tests that compare encoded chunks byte for byte.

pub use rmpv::Value;

/// An insertion-ordered `string -> value` mapping.
///
/// Values are MessagePack values ([`rmpv::Value`]), so anything the wire
/// format can carry is accepted. Records are immutable once appended to a
/// buffer; this type is only mutated while the caller is building it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, Value)>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing an existing entry in place so the
    /// original insertion position is kept.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.set(key, value);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_preserves_insertion_order() {
        let mut record = Record::new();
        record.set("zebra", 1_i64);
        record.set("alpha", 2_i64);
        record.set("mike", 3_i64);

        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zebra", "alpha", "mike"]);
    }

    #[test]
    fn test_record_set_replaces_in_place() {
        let mut record = Record::new();
        record.set("level", "info");
        record.set("message", "hello");
        record.set("level", "warn");

        assert_eq!(record.len(), 2);
        assert_eq!(record.get("level"), Some(&Value::from("warn")));
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["level", "message"]);
    }

    #[test]
    fn test_record_get_missing() {
        let record = Record::new();
        assert!(record.get("absent").is_none());
        assert!(record.is_empty());
    }

    #[test]
    fn test_record_from_iterator() {
        let record: Record = vec![("message", "hi"), ("host", "web-1")]
            .into_iter()
            .collect();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("host"), Some(&Value::from("web-1")));
    }
}
