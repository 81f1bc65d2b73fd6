//! Named metric records emitted by optimization steps.
//!
//! A [`Record`] is a small key-value map that trainers return from their
//! update steps so callers can log or aggregate metrics without the trainer
//! knowing where they end up.
use std::collections::{hash_map::Iter, HashMap};

/// A value stored in a [`Record`].
#[derive(Clone, Debug)]
pub enum RecordValue {
    /// A single floating-point metric.
    Scalar(f32),

    /// A text value.
    String(String),
}

/// A container of named metric values.
#[derive(Clone, Debug, Default)]
pub struct Record(HashMap<String, RecordValue>);

impl Record {
    /// Creates an empty record.
    pub fn empty() -> Self {
        Self(HashMap::new())
    }

    /// Creates a record holding a single scalar.
    pub fn from_scalar(name: impl Into<String>, value: f32) -> Self {
        Self(HashMap::from([(name.into(), RecordValue::Scalar(value))]))
    }

    /// Inserts a value, replacing any previous entry under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: RecordValue) {
        self.0.insert(key.into(), value);
    }

    /// Returns the scalar stored under `key`, if present.
    pub fn get_scalar(&self, key: &str) -> Option<f32> {
        match self.0.get(key) {
            Some(RecordValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    /// Merges another record into this one, the other side winning on
    /// duplicate keys.
    pub fn merge(mut self, other: Record) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Whether the record holds no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in arbitrary order.
    pub fn iter(&self) -> Iter<'_, String, RecordValue> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_the_other_side() {
        let a = Record::from_scalar("loss", 1.0);
        let b = Record::from_scalar("loss", 2.0);
        assert_eq!(a.merge(b).get_scalar("loss"), Some(2.0));
    }

    #[test]
    fn get_scalar_ignores_strings() {
        let mut r = Record::empty();
        r.insert("phase", RecordValue::String("collect".into()));
        assert_eq!(r.get_scalar("phase"), None);
    }
}
