//! Owned state snapshots and deltas.

use super::{initial_value, merge_value, StateSchema, ERRORS_FIELD, SESSION_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An immutable view of pipeline state.
///
/// Stages receive a `State` snapshot taken when they are launched. The
/// snapshot is guaranteed to contain the merged deltas of every declared
/// dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    fields: BTreeMap<String, serde_json::Value>,
}

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Sets a field in place.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }

    /// Gets a field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Gets a string field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(serde_json::Value::as_str)
    }

    /// Gets an array field, empty if absent or not an array.
    #[must_use]
    pub fn get_array(&self, key: &str) -> &[serde_json::Value] {
        self.fields
            .get(key)
            .and_then(serde_json::Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    /// Checks if a field exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the state has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.fields.iter()
    }

    /// Returns the run's session id, if set.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.get_str(SESSION_FIELD)
    }

    /// Returns a new state with `delta` merged under `schema`.
    #[must_use]
    pub fn merged(&self, delta: &StateDelta, schema: &StateSchema) -> Self {
        let mut next = self.clone();
        for (key, incoming) in delta.iter() {
            let policy = schema.policy(key);
            match next.fields.get_mut(key) {
                Some(current) => merge_value(policy, current, incoming),
                None => {
                    next.fields.insert(key.clone(), initial_value(policy, incoming));
                }
            }
        }
        next
    }

    /// Returns accumulated stage errors.
    #[must_use]
    pub fn errors(&self) -> &[serde_json::Value] {
        self.get_array(ERRORS_FIELD)
    }

    /// Returns true if any stage recorded an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Returns the number of recorded errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors().len()
    }

    /// Groups error messages by the stage that recorded them.
    #[must_use]
    pub fn errors_by_stage(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_stage: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for error in self.errors() {
            let stage = error
                .get("stage")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown");
            let message = error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            by_stage.entry(stage.to_string()).or_default().push(message.to_string());
        }
        by_stage
    }

    /// Consumes the state and returns its fields.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, serde_json::Value> {
        self.fields
    }
}

impl FromIterator<(String, serde_json::Value)> for State {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A partial state update produced by one stage execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    fields: BTreeMap<String, serde_json::Value>,
}

impl StateDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a delta touching a single field.
    #[must_use]
    pub fn single(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new().with(key, value)
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Sets a field in place.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }

    /// Gets a field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Returns the names of touched fields.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Iterates over touched fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.fields.iter()
    }

    /// Returns the number of touched fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the delta touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, serde_json::Value)> for StateDelta {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
