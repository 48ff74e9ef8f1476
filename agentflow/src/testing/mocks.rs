//! Stage doubles for tests.

use crate::stages::{Stage, StageContext};
use crate::state::{State, StateDelta};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A stage that sleeps, then returns a fixed delta.
#[derive(Debug, Default)]
pub struct SleepStage {
    delay: Duration,
    output: StateDelta,
}

impl SleepStage {
    /// Creates a stage that sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            output: StateDelta::new(),
        }
    }

    /// Creates a stage that sleeps for `ms` milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Adds a field to the returned delta.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.output.set(key, value);
        self
    }
}

#[async_trait]
impl Stage for SleepStage {
    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StateDelta> {
        tokio::time::sleep(self.delay).await;
        Ok(self.output.clone())
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    error: String,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a stage failing with `error`.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of attempts made against this stage.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StateDelta> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("{}", self.error)
    }
}

/// A stage that fails a fixed number of times before succeeding.
#[derive(Debug)]
pub struct FlakyStage {
    failures: usize,
    output: StateDelta,
    calls: AtomicUsize,
}

impl FlakyStage {
    /// Creates a stage whose first `failures` attempts fail.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            output: StateDelta::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Adds a field to the delta returned on success.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.output.set(key, value);
        self
    }

    /// Number of attempts made against this stage.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FlakyStage {
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StateDelta> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("transient failure {call} in {}", ctx.stage());
        }
        Ok(self.output.clone())
    }
}

/// A stage that panics.
#[derive(Debug)]
pub struct PanickingStage {
    message: String,
}

impl PanickingStage {
    /// Creates a stage panicking with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Stage for PanickingStage {
    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StateDelta> {
        panic!("{}", self.message)
    }
}

/// A recorded execution.
#[derive(Debug, Clone)]
pub struct RecordedExecution {
    /// Stage name from context.
    pub stage_name: String,
    /// Attempt number from context.
    pub attempt: usize,
    /// Snapshot the stage was given.
    pub input: State,
}

/// A stage that records the inputs it sees.
#[derive(Debug, Default)]
pub struct RecordingStage {
    output: StateDelta,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field to the returned delta.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.output.set(key, value);
        self
    }

    /// Returns all recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().clone()
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Returns the last snapshot seen, if any.
    #[must_use]
    pub fn last_input(&self) -> Option<State> {
        self.executions.lock().last().map(|e| e.input.clone())
    }
}

#[async_trait]
impl Stage for RecordingStage {
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StateDelta> {
        self.executions.lock().push(RecordedExecution {
            stage_name: ctx.stage().to_string(),
            attempt: ctx.attempt(),
            input: ctx.state().clone(),
        });
        Ok(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageServices;
    use serde_json::json;
    use std::sync::Arc;

    fn test_context(name: &str) -> StageContext {
        let state = State::new().with("query", json!("lithium"));
        StageContext::new(name, "s-1", Arc::new(state), StageServices::default())
    }

    #[tokio::test]
    async fn test_flaky_stage() {
        let stage = FlakyStage::new(1).with_output("ok", json!(true));
        let ctx = test_context("flaky");

        assert!(stage.run(&ctx).await.is_err());
        let delta = stage.run(&ctx).await.unwrap();
        assert_eq!(delta.get("ok"), Some(&json!(true)));
        assert_eq!(stage.calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_stage() {
        let stage = FailingStage::new("boom");
        let err = stage.run(&test_context("failing")).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(stage.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stage() {
        let stage = SleepStage::with_delay_ms(40).with_output("done", json!(1));
        let started = tokio::time::Instant::now();

        let delta = stage.run(&test_context("sleep")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(40));
        assert_eq!(delta.get("done"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_recording_stage() {
        let stage = RecordingStage::new();
        stage.run(&test_context("recorder")).await.unwrap();

        let executions = stage.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].stage_name, "recorder");
        assert_eq!(executions[0].attempt, 1);
        assert_eq!(stage.last_input().unwrap().get_str("query"), Some("lithium"));
    }
}
