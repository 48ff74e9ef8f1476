//! Stage specifications.

use super::retry::RetryPolicy;
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Definition of one pipeline node.
///
/// Timeout and retry budget fall back to the pipeline defaults when unset.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The task body.
    pub runner: Arc<dyn Stage>,
    /// Names of stages whose deltas must be merged before this one starts.
    pub dependencies: BTreeSet<String>,
    /// Per-attempt timeout override.
    pub timeout: Option<Duration>,
    /// Retry policy override.
    pub retry: Option<RetryPolicy>,
    /// Attempt budget override, applied on top of whichever policy is in effect.
    pub max_attempts: Option<usize>,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            dependencies: BTreeSet::new(),
            timeout: None,
            retry: None,
            max_attempts: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Overrides the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Overrides only the attempt budget.
    ///
    /// Backoff settings still come from the stage's own policy, or from the
    /// pipeline default when the stage has none.
    #[must_use]
    pub fn with_max_retries(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Resolves the effective retry policy against a pipeline default.
    #[must_use]
    pub fn effective_retry(&self, default: &RetryPolicy) -> RetryPolicy {
        let policy = self.retry.clone().unwrap_or_else(|| default.clone());
        match self.max_attempts {
            Some(attempts) => policy.with_max_attempts(attempts),
            None => policy,
        }
    }

    /// Returns true if the stage has no dependencies.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }
}
