//! Concurrently mergeable state owned by a pipeline run.

use super::{initial_value, merge_value, State, StateDelta, StateSchema};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// The single mutable state of a pipeline run.
///
/// Each field lives in its own `DashMap` slot. A merge updates one field at a
/// time through the entry API, so the read-modify-write of a field is atomic
/// with respect to other merges touching that field, while merges touching
/// different fields never contend on a global lock.
#[derive(Debug)]
pub struct SharedState {
    fields: DashMap<String, serde_json::Value>,
    schema: Arc<StateSchema>,
}

impl SharedState {
    /// Creates shared state from initial values.
    #[must_use]
    pub fn new(schema: Arc<StateSchema>, initial: State) -> Self {
        let fields = DashMap::new();
        for (key, value) in initial.into_inner() {
            fields.insert(key, value);
        }
        Self { fields, schema }
    }

    /// Returns the schema used for merging.
    #[must_use]
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Merges a delta field by field.
    pub fn merge(&self, delta: &StateDelta) {
        for (key, incoming) in delta.iter() {
            let policy = self.schema.policy(key);
            trace!(field = %key, policy = %policy, "Merging field");
            self.fields
                .entry(key.clone())
                .and_modify(|current| merge_value(policy, current, incoming))
                .or_insert_with(|| initial_value(policy, incoming));
        }
    }

    /// Gets a copy of a single field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.fields.get(key).map(|v| v.value().clone())
    }

    /// Takes a read-only snapshot of all fields.
    #[must_use]
    pub fn snapshot(&self) -> State {
        self.fields
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared(schema: StateSchema) -> Arc<SharedState> {
        Arc::new(SharedState::new(Arc::new(schema), State::new()))
    }

    #[test]
    fn test_merge_overwrite_and_append() {
        let state = shared(StateSchema::new().append("messages"));

        state.merge(&StateDelta::new().with("messages", json!(["hi"])).with("phase", json!("planning")));
        state.merge(&StateDelta::new().with("messages", json!(["there"])).with("phase", json!("research")));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.get("messages"), Some(&json!(["hi", "there"])));
        assert_eq!(snapshot.get_str("phase"), Some("research"));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let state = shared(StateSchema::new());
        state.merge(&StateDelta::single("phase", json!("planning")));

        let before = state.snapshot();
        state.merge(&StateDelta::single("phase", json!("analysis")));

        assert_eq!(before.get_str("phase"), Some("planning"));
        assert_eq!(state.get("phase"), Some(json!("analysis")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_to_one_field_are_not_lost() {
        let state = shared(StateSchema::new().append("findings"));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state.merge(&StateDelta::single("findings", json!([i])));
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let findings = state.snapshot();
        let mut values: Vec<i64> = findings
            .get_array("findings")
            .iter()
            .filter_map(serde_json::Value::as_i64)
            .collect();
        values.sort_unstable();
        assert_eq!(values, (0..64).collect::<Vec<_>>());
    }
}
