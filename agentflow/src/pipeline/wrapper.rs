//! Timeout, retry and error conversion around a single stage.
//!
//! The wrapper never lets a fault escape. Each attempt runs under the stage
//! timeout with panics caught; failures sleep on the backoff schedule and
//! retry until the budget is spent, at which point the last fault becomes an
//! error delta appended to the errors field.

use super::retry::RetryPolicy;
use crate::errors::StageFault;
use crate::events::ProgressStatus;
use crate::stages::{Stage, StageContext};
use crate::state::{StateDelta, ERRORS_FIELD};
use crate::utils::{iso_timestamp, panic_message};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest error message kept in the errors field.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Result of one stage attempt.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The body returned a delta.
    Success(StateDelta),
    /// The body returned an error or panicked.
    Failure {
        /// The fault.
        error: StageFault,
        /// 1-indexed attempt number.
        attempt: usize,
    },
    /// The attempt exceeded its timeout.
    TimedOut {
        /// 1-indexed attempt number.
        attempt: usize,
        /// The limit that was exceeded.
        timeout: Duration,
    },
}

impl TaskOutcome {
    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns the delta of a successful outcome.
    #[must_use]
    pub fn delta(&self) -> Option<&StateDelta> {
        match self {
            Self::Success(delta) => Some(delta),
            _ => None,
        }
    }

    /// Returns the fault behind a failed outcome.
    #[must_use]
    pub fn fault(&self, stage: &str) -> Option<StageFault> {
        match self {
            Self::Success(_) => None,
            Self::Failure { error, .. } => Some(error.clone()),
            Self::TimedOut { timeout, .. } => Some(StageFault::Timeout {
                stage: stage.to_string(),
                timeout: *timeout,
            }),
        }
    }
}

/// Everything the scheduler needs from a wrapped stage execution.
#[derive(Debug, Clone)]
pub struct StageRun {
    /// Outcome of the last attempt.
    pub outcome: TaskOutcome,
    /// Delta to merge: the stage's output, or the error delta.
    pub delta: StateDelta,
    /// Attempts made.
    pub attempts: usize,
    /// Wall time across all attempts and sleeps.
    pub duration: Duration,
}

impl StageRun {
    /// Returns true if the stage produced its own delta.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Runs a stage with timeout and retry.
#[derive(Debug, Clone)]
pub struct TaskWrapper {
    timeout: Duration,
    retry: RetryPolicy,
}

impl TaskWrapper {
    /// Creates a wrapper.
    #[must_use]
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs a single attempt under the timeout, catching panics.
    pub async fn attempt(&self, stage: &dyn Stage, ctx: &StageContext) -> TaskOutcome {
        let attempt = ctx.attempt();
        let body = AssertUnwindSafe(stage.run(ctx)).catch_unwind();

        match tokio::time::timeout(self.timeout, body).await {
            Ok(Ok(Ok(delta))) => TaskOutcome::Success(delta),
            Ok(Ok(Err(e))) => TaskOutcome::Failure {
                error: StageFault::Exception {
                    stage: ctx.stage().to_string(),
                    message: format!("{e:#}"),
                },
                attempt,
            },
            Ok(Err(panic)) => TaskOutcome::Failure {
                error: StageFault::Exception {
                    stage: ctx.stage().to_string(),
                    message: format!("panicked: {}", panic_message(panic.as_ref())),
                },
                attempt,
            },
            Err(_) => TaskOutcome::TimedOut {
                attempt,
                timeout: self.timeout,
            },
        }
    }

    /// Runs the stage until it succeeds or the retry budget is spent.
    pub async fn execute(&self, stage: &dyn Stage, ctx: StageContext) -> StageRun {
        let start = Instant::now();
        let attempts = self.retry.attempts();
        let mut backoff = self.retry.schedule();
        let name = ctx.stage().to_string();
        let mut attempt = 1;

        loop {
            let ctx = ctx.clone().with_attempt(attempt);
            ctx.emit(ProgressStatus::Running, running_message(&name, attempt, attempts))
                .await;
            debug!(stage = %name, attempt, attempts, "Stage attempt started");

            let outcome = self.attempt(stage, &ctx).await;
            let Some(fault) = outcome.fault(&name) else {
                ctx.emit(ProgressStatus::Completed, format!("{name} completed")).await;
                info!(
                    stage = %name,
                    attempt,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Stage completed"
                );
                return StageRun {
                    delta: outcome.delta().cloned().unwrap_or_default(),
                    outcome,
                    attempts: attempt,
                    duration: start.elapsed(),
                };
            };

            if attempt >= attempts {
                ctx.emit(ProgressStatus::Failed, fault.to_string()).await;
                error!(stage = %name, attempts = attempt, error = %fault, "Stage failed");
                return StageRun {
                    delta: Self::error_delta(&fault, attempt),
                    outcome,
                    attempts: attempt,
                    duration: start.elapsed(),
                };
            }

            let delay = backoff.delay_after(attempt - 1);
            warn!(
                stage = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %fault,
                "Stage attempt failed, retrying"
            );
            ctx.emit(
                ProgressStatus::Retrying,
                format!("{fault}; retrying in {:.1}s", delay.as_secs_f64()),
            )
            .await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Builds the delta recorded when a stage gives up.
    #[must_use]
    pub fn error_delta(fault: &StageFault, attempts: usize) -> StateDelta {
        let entry = serde_json::json!({
            "stage": fault.stage(),
            "message": truncate_message(&fault.to_string()),
            "kind": fault.kind(),
            "attempts": attempts,
            "timestamp": iso_timestamp(),
        });
        StateDelta::single(ERRORS_FIELD, serde_json::Value::Array(vec![entry]))
    }
}

fn running_message(stage: &str, attempt: usize, attempts: usize) -> String {
    if attempt == 1 {
        format!("Starting {stage}")
    } else {
        format!("Starting {stage} (attempt {attempt}/{attempts})")
    }
}

/// Truncates to [`MAX_ERROR_MESSAGE_CHARS`] characters, marking the cut with `...`.
#[must_use]
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingProgressSink;
    use crate::stages::StageServices;
    use crate::state::State;
    use crate::testing::{FailingStage, FlakyStage, PanickingStage, SleepStage};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn context(sink: Arc<CollectingProgressSink>) -> StageContext {
        let services = StageServices {
            progress: sink,
            ..StageServices::default()
        };
        StageContext::new("web_research", "s-1", Arc::new(State::new()), services)
    }

    fn wrapper(attempts: usize) -> TaskWrapper {
        TaskWrapper::new(
            Duration::from_secs(5),
            RetryPolicy::default().with_max_attempts(attempts),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let sink = Arc::new(CollectingProgressSink::new());
        let stage = SleepStage::new(Duration::from_millis(10)).with_output("findings", json!(["a"]));

        let run = wrapper(3).execute(&stage, context(sink.clone())).await;

        assert!(run.succeeded());
        assert_eq!(run.attempts, 1);
        assert_eq!(run.delta.get("findings"), Some(&json!(["a"])));
        assert_eq!(
            sink.statuses_for("web_research"),
            vec![ProgressStatus::Running, ProgressStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_stage_recovers() {
        let sink = Arc::new(CollectingProgressSink::new());
        let stage = FlakyStage::new(2).with_output("findings", json!(["ok"]));

        let started = tokio::time::Instant::now();
        let run = wrapper(3).execute(&stage, context(sink.clone())).await;

        assert!(run.succeeded());
        assert_eq!(run.attempts, 3);
        assert_eq!(stage.calls(), 3);
        // 1s + 2s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(
            sink.statuses_for("web_research"),
            vec![
                ProgressStatus::Running,
                ProgressStatus::Retrying,
                ProgressStatus::Running,
                ProgressStatus::Retrying,
                ProgressStatus::Running,
                ProgressStatus::Completed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_produce_error_delta() {
        let sink = Arc::new(CollectingProgressSink::new());
        let stage = FailingStage::new("Tavily quota exceeded");

        let run = wrapper(2).execute(&stage, context(sink.clone())).await;

        assert!(!run.succeeded());
        assert_eq!(run.attempts, 2);
        let errors = run.delta.get(ERRORS_FIELD).unwrap().as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["stage"], "web_research");
        assert_eq!(errors[0]["kind"], "stage_exception");
        assert_eq!(errors[0]["message"], "web_research error: Tavily quota exceeded");
        assert_eq!(errors[0]["attempts"], 2);
        assert_eq!(sink.statuses_for("web_research").last(), Some(&ProgressStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_fault() {
        let stage = SleepStage::new(Duration::from_secs(60));
        let wrapper = TaskWrapper::new(Duration::from_secs(1), RetryPolicy::no_retry());

        let run = wrapper
            .execute(&stage, context(Arc::new(CollectingProgressSink::new())))
            .await;

        assert!(matches!(run.outcome, TaskOutcome::TimedOut { attempt: 1, .. }));
        let errors = run.delta.get(ERRORS_FIELD).unwrap();
        assert_eq!(errors[0]["kind"], "stage_timeout");
        assert_eq!(errors[0]["message"], "web_research timed out after 1s");
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let stage = PanickingStage::new("index out of bounds");

        let run = TaskWrapper::new(Duration::from_secs(1), RetryPolicy::no_retry())
            .execute(&stage, context(Arc::new(CollectingProgressSink::new())))
            .await;

        match run.outcome {
            TaskOutcome::Failure { error, attempt } => {
                assert_eq!(attempt, 1);
                assert!(error.to_string().contains("panicked: index out of bounds"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(250);
        let truncated = truncate_message(&long);

        assert_eq!(truncated.chars().count(), MAX_ERROR_MESSAGE_CHARS + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn test_error_delta_targets_errors_field() {
        let fault = StageFault::Exception {
            stage: "analyst".into(),
            message: "bad json".into(),
        };

        let delta = TaskWrapper::error_delta(&fault, 1);
        let errors = delta.get(ERRORS_FIELD).unwrap().as_array().unwrap();
        assert_eq!(errors[0]["stage"], "analyst");
        assert_eq!(errors[0]["attempts"], 1);
    }
}
