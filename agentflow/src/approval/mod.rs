//! Human-in-the-loop approval gate.
//!
//! A stage registers an [`ApprovalRequest`] and suspends in
//! [`ApprovalGate::wait`] until a human submits a decision or the timeout
//! fires. Each request owns a single-use oneshot channel; the gate's mutex
//! decides which of "response submitted" and "timeout expired" happens
//! first, and the other becomes a no-op.

mod types;

pub use types::{ApprovalRequest, ApprovalResponse, ApprovalStatus, Decision, SubmitOutcome};

use crate::config::ApprovalConfig;
use crate::errors::ApprovalError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Boundary operations an external UI needs against the gate.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    /// Submits a human decision.
    async fn submit_response(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> SubmitOutcome;

    /// Lists requests still waiting for a decision.
    async fn list_pending(&self, session_id: &str) -> Vec<ApprovalRequest>;
}

struct ApprovalRecord {
    request: ApprovalRequest,
    response: Option<ApprovalResponse>,
    tx: Option<oneshot::Sender<ApprovalResponse>>,
    rx: Option<oneshot::Receiver<ApprovalResponse>>,
}

type SessionApprovals = HashMap<String, ApprovalRecord>;

/// Registry of approval requests, grouped by session.
pub struct ApprovalGate {
    sessions: Mutex<HashMap<String, SessionApprovals>>,
    default_timeout: Duration,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::from_config(&ApprovalConfig::default())
    }
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("sessions", &self.session_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ApprovalGate {
    /// Creates an empty gate with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gate from configuration.
    #[must_use]
    pub fn from_config(config: &ApprovalConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            default_timeout: config.timeout(),
        }
    }

    /// Sets the timeout used by [`StageContext::request_approval`](crate::stages::StageContext::request_approval).
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns the default wait timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registers a new pending request.
    pub fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest, ApprovalError> {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(request.session_id.clone()).or_default();
        if session.contains_key(&request.approval_id) {
            return Err(ApprovalError::Duplicate {
                session_id: request.session_id,
                approval_id: request.approval_id,
            });
        }

        let mut request = request;
        request.status = ApprovalStatus::Pending;
        let (tx, rx) = oneshot::channel();
        session.insert(
            request.approval_id.clone(),
            ApprovalRecord {
                request: request.clone(),
                response: None,
                tx: Some(tx),
                rx: Some(rx),
            },
        );

        info!(
            session_id = %request.session_id,
            approval_id = %request.approval_id,
            stage = %request.stage,
            "Approval requested"
        );
        Ok(request)
    }

    /// Returns the existing request with this id if the same stage made it,
    /// otherwise registers a new one.
    ///
    /// A retried stage attempt asks again with the same id and picks up the
    /// original request, including any response submitted in between.
    pub fn resume_or_create(&self, request: ApprovalRequest) -> Result<ApprovalRequest, ApprovalError> {
        {
            let mut sessions = self.sessions.lock();
            if let Ok(record) = lookup(&mut sessions, &request.session_id, &request.approval_id) {
                if record.request.stage != request.stage {
                    return Err(ApprovalError::Duplicate {
                        session_id: request.session_id,
                        approval_id: request.approval_id,
                    });
                }
                debug!(
                    session_id = %request.session_id,
                    approval_id = %request.approval_id,
                    status = %record.request.status,
                    "Resuming approval"
                );
                return Ok(record.request.clone());
            }
        }
        self.create(request)
    }

    /// Waits for a decision.
    ///
    /// `None` waits until a decision arrives or the session is cleaned up.
    /// If the request was already answered, the stored response is returned
    /// immediately. Only one caller may wait on a given request at a time.
    /// Dropping the returned future hands the request back to the gate, so
    /// it stays pending and can be waited on again.
    pub async fn wait(
        &self,
        session_id: &str,
        approval_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let rx = {
            let mut sessions = self.sessions.lock();
            let record = lookup(&mut sessions, session_id, approval_id)?;
            match record.request.status {
                ApprovalStatus::Responded => {
                    if let Some(response) = record.response.clone() {
                        return Ok(response);
                    }
                    return Err(cancelled(approval_id));
                }
                ApprovalStatus::TimedOut => {
                    return Err(ApprovalError::AlreadyResolved {
                        approval_id: approval_id.to_string(),
                        status: ApprovalStatus::TimedOut.to_string(),
                    });
                }
                ApprovalStatus::Pending => {
                    record.rx.take().ok_or_else(|| ApprovalError::AlreadyWaiting {
                        approval_id: approval_id.to_string(),
                    })?
                }
            }
        };

        debug!(session_id, approval_id, ?timeout, "Waiting for approval");

        let mut waiter = Waiter {
            gate: self,
            session_id,
            approval_id,
            rx: Some(rx),
        };
        match timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, waiter.recv()).await;
                waiter.finish();
                match waited {
                    Ok(received) => received,
                    Err(_) => self.expire(session_id, approval_id, limit),
                }
            }
            None => {
                let received = waiter.recv().await;
                waiter.finish();
                received
            }
        }
    }

    // The waiter was dropped mid-wait. Put the receiver back while the
    // request is still pending.
    fn release(&self, session_id: &str, approval_id: &str, rx: oneshot::Receiver<ApprovalResponse>) {
        let mut sessions = self.sessions.lock();
        if let Ok(record) = lookup(&mut sessions, session_id, approval_id) {
            if record.request.status == ApprovalStatus::Pending {
                record.rx = Some(rx);
                debug!(session_id, approval_id, "Approval waiter released");
            }
        }
    }

    // Timer fired. A submit that took the lock first still wins.
    fn expire(
        &self,
        session_id: &str,
        approval_id: &str,
        limit: Duration,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let mut sessions = self.sessions.lock();
        let Ok(record) = lookup(&mut sessions, session_id, approval_id) else {
            return Err(cancelled(approval_id));
        };

        match record.request.status {
            ApprovalStatus::Responded => record.response.clone().ok_or_else(|| cancelled(approval_id)),
            ApprovalStatus::Pending | ApprovalStatus::TimedOut => {
                record.request.status = ApprovalStatus::TimedOut;
                record.tx = None;
                warn!(session_id, approval_id, timeout_secs = limit.as_secs_f64(), "Approval timed out");
                Err(ApprovalError::Timeout {
                    approval_id: approval_id.to_string(),
                    timeout_seconds: limit.as_secs_f64(),
                })
            }
        }
    }

    /// Records a decision and wakes the waiter.
    ///
    /// Fails if the id is unknown or the request is no longer pending.
    pub fn try_submit(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<ApprovalResponse, ApprovalError> {
        let mut sessions = self.sessions.lock();
        let record = lookup(&mut sessions, session_id, approval_id)?;

        if record.request.status.is_terminal() {
            return Err(ApprovalError::AlreadyResolved {
                approval_id: approval_id.to_string(),
                status: record.request.status.to_string(),
            });
        }

        let response = ApprovalResponse::new(approval_id, decision, feedback);
        record.request.status = ApprovalStatus::Responded;
        record.response = Some(response.clone());
        if let Some(tx) = record.tx.take() {
            // Nobody waiting yet is fine; `wait` reads the stored response.
            let _ = tx.send(response.clone());
        }

        info!(
            session_id,
            approval_id,
            decision = %response.decision,
            "Approval response received"
        );
        Ok(response)
    }

    /// Records a decision, returning false if it was not accepted.
    pub fn submit(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> bool {
        self.try_submit(session_id, approval_id, decision, feedback).is_ok()
    }

    /// Returns pending requests for a session, oldest first.
    #[must_use]
    pub fn pending_for(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let sessions = self.sessions.lock();
        let mut pending: Vec<ApprovalRequest> = sessions
            .get(session_id)
            .map(|session| {
                session
                    .values()
                    .filter(|r| r.request.status == ApprovalStatus::Pending)
                    .map(|r| r.request.clone())
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        pending
    }

    /// Returns a request's status.
    #[must_use]
    pub fn status(&self, session_id: &str, approval_id: &str) -> Option<ApprovalStatus> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.get(approval_id))
            .map(|r| r.request.status)
    }

    /// Returns the recorded response, if any.
    #[must_use]
    pub fn response(&self, session_id: &str, approval_id: &str) -> Option<ApprovalResponse> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.get(approval_id))
            .and_then(|r| r.response.clone())
    }

    /// Drops all state for a session. Blocked waiters fail with `Cancelled`.
    ///
    /// Returns the number of requests removed.
    pub fn cleanup(&self, session_id: &str) -> usize {
        let removed = self.sessions.lock().remove(session_id);
        let count = removed.as_ref().map_or(0, HashMap::len);
        if count > 0 {
            debug!(session_id, count, "Cleaned up approvals");
        }
        count
    }

    /// Returns the number of sessions with registered requests.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Owns the receiver while a caller waits; returns it to the gate on drop.
struct Waiter<'a> {
    gate: &'a ApprovalGate,
    session_id: &'a str,
    approval_id: &'a str,
    rx: Option<oneshot::Receiver<ApprovalResponse>>,
}

impl Waiter<'_> {
    async fn recv(&mut self) -> Result<ApprovalResponse, ApprovalError> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.map_err(|_| cancelled(self.approval_id)),
            None => Err(cancelled(self.approval_id)),
        }
    }

    // The receiver is spent or the timer fired; nothing to hand back.
    fn finish(&mut self) {
        self.rx = None;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.gate.release(self.session_id, self.approval_id, rx);
        }
    }
}

fn lookup<'a>(
    sessions: &'a mut HashMap<String, SessionApprovals>,
    session_id: &str,
    approval_id: &str,
) -> Result<&'a mut ApprovalRecord, ApprovalError> {
    sessions
        .get_mut(session_id)
        .and_then(|s| s.get_mut(approval_id))
        .ok_or_else(|| ApprovalError::NotFound {
            session_id: session_id.to_string(),
            approval_id: approval_id.to_string(),
        })
}

fn cancelled(approval_id: &str) -> ApprovalError {
    ApprovalError::Cancelled {
        approval_id: approval_id.to_string(),
    }
}

#[async_trait]
impl ApprovalTransport for ApprovalGate {
    async fn submit_response(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> SubmitOutcome {
        match self.try_submit(session_id, approval_id, decision, feedback) {
            Ok(_) => SubmitOutcome::Accepted,
            Err(ApprovalError::NotFound { .. }) => SubmitOutcome::NotFound,
            Err(_) => SubmitOutcome::AlreadyResolved,
        }
    }

    async fn list_pending(&self, session_id: &str) -> Vec<ApprovalRequest> {
        self.pending_for(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest::new("s-1", id, "Proceed with this research plan?").with_stage("coordinator")
    }

    #[tokio::test]
    async fn test_submit_wakes_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        gate.create(request("plan")).unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait("s-1", "plan", Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(gate.submit("s-1", "plan", Decision::Approve, Some("looks good".into())));

        let response = waiter.await.unwrap().unwrap();
        assert!(response.decision.is_approved());
        assert_eq!(response.feedback.as_deref(), Some("looks good"));
        assert_eq!(gate.status("s-1", "plan"), Some(ApprovalStatus::Responded));
    }

    #[tokio::test]
    async fn test_reject_is_a_normal_response() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();
        gate.submit("s-1", "plan", Decision::Reject, None);

        let response = gate.wait("s-1", "plan", Some(Duration::from_secs(1))).await.unwrap();
        assert!(response.decision.is_rejected());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();

        let err = gate.create(request("plan")).unwrap_err();
        assert!(matches!(err, ApprovalError::Duplicate { .. }));

        // Same id in another session is fine.
        gate.create(ApprovalRequest::new("s-2", "plan", "?")).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_timed_out() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();

        let err = gate
            .wait("s-1", "plan", Some(Duration::from_secs(300)))
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::Timeout { .. }));
        assert_eq!(gate.status("s-1", "plan"), Some(ApprovalStatus::TimedOut));
        assert!(!gate.submit("s-1", "plan", Decision::Approve, None));
        assert!(gate.pending_for("s-1").is_empty());
    }

    #[tokio::test]
    async fn test_resubmission_rejected() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();

        assert!(gate.submit("s-1", "plan", Decision::Approve, None));
        let err = gate
            .try_submit("s-1", "plan", Decision::Reject, None)
            .unwrap_err();

        assert!(matches!(err, ApprovalError::AlreadyResolved { .. }));
        assert_eq!(gate.response("s-1", "plan").unwrap().decision, Decision::Approve);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_stays_pending() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();

        // The caller gives up before the gate's own timer fires.
        let abandoned = tokio::time::timeout(
            Duration::from_secs(120),
            gate.wait("s-1", "plan", Some(Duration::from_secs(300))),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(gate.status("s-1", "plan"), Some(ApprovalStatus::Pending));
        assert_eq!(gate.pending_for("s-1").len(), 1);

        assert!(gate.submit("s-1", "plan", Decision::Approve, None));
        let response = gate.wait("s-1", "plan", Some(Duration::from_secs(300))).await.unwrap();
        assert!(response.decision.is_approved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_can_be_resumed() {
        let gate = Arc::new(ApprovalGate::new());
        gate.create(request("plan")).unwrap();

        let _ = tokio::time::timeout(Duration::from_secs(1), gate.wait("s-1", "plan", None)).await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait("s-1", "plan", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.submit("s-1", "plan", Decision::Reject, Some("narrow the scope".into()));

        let response = waiter.await.unwrap().unwrap();
        assert!(response.decision.is_rejected());
    }

    #[tokio::test]
    async fn test_resume_or_create() {
        let gate = ApprovalGate::new();
        let first = gate.resume_or_create(request("plan")).unwrap();
        gate.submit("s-1", "plan", Decision::Approve, None);

        let resumed = gate.resume_or_create(request("plan")).unwrap();
        assert_eq!(resumed.requested_at, first.requested_at);
        assert_eq!(resumed.status, ApprovalStatus::Responded);

        let other_stage = ApprovalRequest::new("s-1", "plan", "?").with_stage("analyst");
        let err = gate.resume_or_create(other_stage).unwrap_err();
        assert!(matches!(err, ApprovalError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let gate = ApprovalGate::new();

        assert!(!gate.submit("nope", "plan", Decision::Approve, None));
        let err = gate.wait("nope", "plan", None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_second_waiter_rejected() {
        let gate = Arc::new(ApprovalGate::new());
        gate.create(request("plan")).unwrap();

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait("s-1", "plan", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = gate.wait("s-1", "plan", None).await.unwrap_err();
        assert!(matches!(err, ApprovalError::AlreadyWaiting { .. }));

        gate.submit("s-1", "plan", Decision::Approve, None);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_cancels_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        gate.create(request("plan")).unwrap();
        gate.create(request("charts")).unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait("s-1", "plan", None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(gate.cleanup("s-1"), 2);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ApprovalError::Cancelled { .. }));
        assert_eq!(gate.session_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_for_filters_resolved() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();
        gate.create(request("charts")).unwrap();
        gate.submit("s-1", "plan", Decision::Approve, None);

        let pending = gate.pending_for("s-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_id, "charts");
        assert!(gate.pending_for("s-unknown").is_empty());
    }

    #[tokio::test]
    async fn test_transport_outcomes() {
        let gate = ApprovalGate::new();
        gate.create(request("plan")).unwrap();
        let transport: &dyn ApprovalTransport = &gate;

        assert_eq!(transport.list_pending("s-1").await.len(), 1);
        assert_eq!(
            transport.submit_response("s-1", "plan", Decision::Approve, None).await,
            SubmitOutcome::Accepted
        );
        assert_eq!(
            transport.submit_response("s-1", "plan", Decision::Approve, None).await,
            SubmitOutcome::AlreadyResolved
        );
        assert_eq!(
            transport.submit_response("s-1", "other", Decision::Approve, None).await,
            SubmitOutcome::NotFound
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_and_timeout_race_has_one_winner() {
        let gate = Arc::new(ApprovalGate::new());
        let mut handles = Vec::new();

        for i in 0..50 {
            let session = format!("race-{i}");
            gate.create(ApprovalRequest::new(&session, "gate", "?")).unwrap();

            let waiter = {
                let gate = gate.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    gate.wait(&session, "gate", Some(Duration::from_millis(20))).await
                })
            };
            let submitter = {
                let gate = gate.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    gate.submit(&session, "gate", Decision::Approve, None)
                })
            };
            handles.push((session, waiter, submitter));
        }

        for (session, waiter, submitter) in handles {
            let waited = waiter.await.unwrap();
            let submitted = submitter.await.unwrap();
            let status = gate.status(&session, "gate").unwrap();

            match waited {
                Ok(response) => {
                    assert!(submitted);
                    assert!(response.decision.is_approved());
                    assert_eq!(status, ApprovalStatus::Responded);
                }
                Err(ApprovalError::Timeout { .. }) => {
                    assert!(!submitted);
                    assert_eq!(status, ApprovalStatus::TimedOut);
                }
                Err(other) => panic!("unexpected outcome: {other}"),
            }
        }
    }
}
