//! Shared pipeline state and its per-field merge discipline.
//!
//! A pipeline run owns one [`SharedState`]. Stages never touch it directly:
//! they read an immutable [`State`] snapshot and return a [`StateDelta`],
//! which the scheduler merges field by field according to the
//! [`StateSchema`] declared with the graph.

mod shared;
mod store;

pub use shared::SharedState;
pub use store::{State, StateDelta};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Field that accumulates stage failures.
pub const ERRORS_FIELD: &str = "errors";

/// Field holding the run's session id.
pub const SESSION_FIELD: &str = "session_id";

/// How a delta value is combined with the current value of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Last writer wins.
    #[default]
    Overwrite,
    /// Concatenate sequences in completion order.
    Append,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Append => write!(f, "append"),
        }
    }
}

/// Per-field merge policies declared at graph-definition time.
///
/// Fields that are not declared use [`MergePolicy::Overwrite`].
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    policies: HashMap<String, MergePolicy>,
}

impl StateSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field with the given policy.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, policy: MergePolicy) -> Self {
        self.declare(name, policy);
        self
    }

    /// Declares an append field.
    #[must_use]
    pub fn append(self, name: impl Into<String>) -> Self {
        self.with_field(name, MergePolicy::Append)
    }

    /// Declares an overwrite field.
    #[must_use]
    pub fn overwrite(self, name: impl Into<String>) -> Self {
        self.with_field(name, MergePolicy::Overwrite)
    }

    /// Declares a field in place, replacing any earlier declaration.
    pub fn declare(&mut self, name: impl Into<String>, policy: MergePolicy) {
        self.policies.insert(name.into(), policy);
    }

    /// Returns the effective policy for a field.
    #[must_use]
    pub fn policy(&self, field: &str) -> MergePolicy {
        self.policies.get(field).copied().unwrap_or_default()
    }

    /// Returns the declared policy, if any.
    #[must_use]
    pub fn declared(&self, field: &str) -> Option<MergePolicy> {
        self.policies.get(field).copied()
    }

    /// Returns the number of declared fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns true if no field is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Merges `incoming` into an existing field value.
pub(crate) fn merge_value(policy: MergePolicy, current: &mut serde_json::Value, incoming: &serde_json::Value) {
    match policy {
        MergePolicy::Overwrite => *current = incoming.clone(),
        MergePolicy::Append => {
            if !current.is_array() {
                let previous = current.take();
                *current = if previous.is_null() {
                    serde_json::Value::Array(Vec::new())
                } else {
                    serde_json::Value::Array(vec![previous])
                };
            }
            if let serde_json::Value::Array(items) = current {
                items.extend(append_items(incoming));
            }
        }
    }
}

/// Value a field takes when the first delta touching it arrives.
pub(crate) fn initial_value(policy: MergePolicy, incoming: &serde_json::Value) -> serde_json::Value {
    match policy {
        MergePolicy::Overwrite => incoming.clone(),
        MergePolicy::Append => serde_json::Value::Array(append_items(incoming)),
    }
}

// Arrays contribute their elements, null contributes nothing, scalars one element.
fn append_items(incoming: &serde_json::Value) -> Vec<serde_json::Value> {
    match incoming {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
