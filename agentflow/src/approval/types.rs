//! Approval request and response records.

use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an approval request.
///
/// `Pending` moves to exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a human.
    Pending,
    /// A decision was submitted.
    Responded,
    /// Nobody answered in time.
    TimedOut,
}

impl ApprovalStatus {
    /// Returns true for `Responded` and `TimedOut`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Responded => write!(f, "responded"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A human decision.
///
/// Parsed case-insensitively; anything other than approve/reject is kept
/// verbatim as `Other`, for requests with custom options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Decision {
    /// Proceed.
    Approve,
    /// Do not proceed.
    Reject,
    /// A custom option.
    Other(String),
}

impl Decision {
    /// Parses a decision string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Self::Approve,
            "reject" | "rejected" => Self::Reject,
            _ => Self::Other(value.trim().to_string()),
        }
    }

    /// Returns true for `Approve`.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }

    /// Returns true for `Reject`.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Reject)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for Decision {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for Decision {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<Decision> for String {
    fn from(value: Decision) -> Self {
        value.to_string()
    }
}

/// A pending or resolved request for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Owning session.
    pub session_id: String,
    /// Id, unique within the session.
    pub approval_id: String,
    /// Stage that asked.
    pub stage: String,
    /// Question shown to the human.
    pub question: String,
    /// Choices offered.
    pub options: Vec<String>,
    /// Opaque payload for the UI.
    pub context: serde_json::Value,
    /// Current status.
    pub status: ApprovalStatus,
    /// When the request was created.
    pub requested_at: Timestamp,
}

impl ApprovalRequest {
    /// Creates a pending request offering Approve/Reject.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        approval_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            approval_id: approval_id.into(),
            stage: String::new(),
            question: question.into(),
            options: default_options(),
            context: serde_json::Value::Object(serde_json::Map::new()),
            status: ApprovalStatus::Pending,
            requested_at: now_utc(),
        }
    }

    /// Sets the requesting stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Sets the UI context payload.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Replaces the offered options. An empty list keeps the defaults.
    #[must_use]
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options: Vec<String> = options.into_iter().map(Into::into).collect();
        if !options.is_empty() {
            self.options = options;
        }
        self
    }
}

fn default_options() -> Vec<String> {
    vec!["Approve".to_string(), "Reject".to_string()]
}

/// A submitted decision. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// The request answered.
    pub approval_id: String,
    /// The decision.
    pub decision: Decision,
    /// Optional free-text feedback.
    pub feedback: Option<String>,
    /// When the decision arrived.
    pub responded_at: Timestamp,
}

impl ApprovalResponse {
    pub(crate) fn new(approval_id: &str, decision: Decision, feedback: Option<String>) -> Self {
        Self {
            approval_id: approval_id.to_string(),
            decision,
            feedback,
            responded_at: now_utc(),
        }
    }
}

/// Result of submitting a decision through a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Recorded and the waiter was woken.
    Accepted,
    /// No such session or approval id.
    NotFound,
    /// The request was already answered or timed out.
    AlreadyResolved,
}
