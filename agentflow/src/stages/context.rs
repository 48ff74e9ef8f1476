//! Execution context handed to a stage attempt.

use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalResponse, ApprovalStatus};
use crate::cache::CacheLayer;
use crate::errors::ApprovalError;
use crate::events::{deliver, NoOpProgressSink, ProgressEvent, ProgressSink, ProgressStatus};
use crate::state::State;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shared services injected into every stage of a run.
#[derive(Clone)]
pub struct StageServices {
    /// Approval gate for human decisions.
    pub approvals: Arc<ApprovalGate>,
    /// Result cache for external lookups.
    pub cache: Arc<CacheLayer>,
    /// Progress sink.
    pub progress: Arc<dyn ProgressSink>,
}

impl Default for StageServices {
    fn default() -> Self {
        Self {
            approvals: Arc::new(ApprovalGate::new()),
            cache: Arc::new(CacheLayer::default()),
            progress: Arc::new(NoOpProgressSink),
        }
    }
}

impl fmt::Debug for StageServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageServices")
            .field("approvals", &self.approvals)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// What a stage sees while it runs.
///
/// The state is a read-only snapshot taken when the stage was launched. It
/// already contains the merged deltas of every dependency.
#[derive(Clone, Debug)]
pub struct StageContext {
    stage: String,
    session_id: String,
    attempt: usize,
    state: Arc<State>,
    services: StageServices,
}

impl StageContext {
    /// Creates a context for the first attempt of a stage.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        session_id: impl Into<String>,
        state: Arc<State>,
        services: StageServices,
    ) -> Self {
        Self {
            stage: stage.into(),
            session_id: session_id.into(),
            attempt: 1,
            state,
            services,
        }
    }

    /// Returns a copy for another attempt (1-indexed).
    #[must_use]
    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Run session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current attempt, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The input state snapshot.
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Shortcut for `state().get(key)`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.get(key)
    }

    /// The approval gate.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.services.approvals
    }

    /// The result cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.services.cache
    }

    /// Emits a progress event for this stage.
    pub async fn emit(&self, status: ProgressStatus, message: impl Into<String>) {
        let event = ProgressEvent::new(&self.stage, status, message)
            .with_session(&self.session_id)
            .with_attempt(self.attempt);
        deliver(self.services.progress.as_ref(), event).await;
    }

    /// Asks a human to approve and waits with the gate's default timeout.
    ///
    /// Emits `waiting_approval` before suspending. The caller decides what
    /// to do on `Timeout` or on a rejected decision.
    pub async fn request_approval(
        &self,
        approval_id: &str,
        question: &str,
        context: serde_json::Value,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let request = ApprovalRequest::new(&self.session_id, approval_id, question).with_context(context);
        let timeout = self.services.approvals.default_timeout();
        self.request_approval_with(request, Some(timeout)).await
    }

    /// Registers a prepared request and waits for it.
    ///
    /// Session and stage on the request are overwritten with this context's.
    /// A retried attempt that asks with the same id resumes the request made
    /// by the earlier attempt instead of registering a duplicate.
    pub async fn request_approval_with(
        &self,
        request: ApprovalRequest,
        timeout: Option<Duration>,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let mut request = request.with_stage(&self.stage);
        request.session_id.clone_from(&self.session_id);

        let created = self.services.approvals.resume_or_create(request)?;
        if created.status == ApprovalStatus::Pending {
            self.emit(ProgressStatus::WaitingApproval, created.question.clone()).await;
        }
        self.services
            .approvals
            .wait(&created.session_id, &created.approval_id, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::Decision;
    use crate::events::CollectingProgressSink;
    use serde_json::json;

    fn context(progress: Arc<dyn ProgressSink>) -> StageContext {
        let services = StageServices {
            progress,
            ..StageServices::default()
        };
        let state = State::new().with("query", json!("EV market"));
        StageContext::new("coordinator", "s-1", Arc::new(state), services)
    }

    #[test]
    fn test_accessors() {
        let ctx = context(Arc::new(NoOpProgressSink)).with_attempt(2);

        assert_eq!(ctx.stage(), "coordinator");
        assert_eq!(ctx.session_id(), "s-1");
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.get("query"), Some(&json!("EV market")));
    }

    #[tokio::test]
    async fn test_request_approval_emits_and_waits() {
        let sink = Arc::new(CollectingProgressSink::new());
        let ctx = context(sink.clone());
        let gate = ctx.approvals().clone();

        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.request_approval("plan", "Proceed with this plan?", json!({"steps": 3}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pending = gate.pending_for("s-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stage, "coordinator");
        assert_eq!(pending[0].context, json!({"steps": 3}));
        gate.submit("s-1", "plan", Decision::Approve, None);

        assert!(handle.await.unwrap().unwrap().decision.is_approved());
        assert_eq!(sink.statuses_for("coordinator"), vec![ProgressStatus::WaitingApproval]);
        assert_eq!(gate.status("s-1", "plan"), Some(ApprovalStatus::Responded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_approval_timeout_is_returned() {
        let ctx = context(Arc::new(NoOpProgressSink));

        let err = ctx
            .request_approval_with(
                ApprovalRequest::new("ignored", "plan", "?"),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::Timeout { .. }));
    }
}
