//! Progress events emitted while stages run.
//!
//! Delivery is best effort: a failing [`ProgressSink`] is logged and
//! otherwise ignored, and never affects pipeline execution.

mod sink;

pub use sink::{
    deliver, ChannelProgressSink, CollectingProgressSink, LoggingProgressSink, NoOpProgressSink,
    ProgressSink,
};

use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status reported for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// An attempt started.
    Running,
    /// An attempt failed and another will follow.
    Retrying,
    /// The stage produced its delta.
    Completed,
    /// The stage exhausted its attempts.
    Failed,
    /// The stage is blocked on a human decision.
    WaitingApproval,
}

impl ProgressStatus {
    /// Returns the progress percentage conventionally reported with this status.
    #[must_use]
    pub const fn default_percent(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Retrying | Self::WaitingApproval => 50,
            Self::Completed | Self::Failed => 100,
        }
    }

    /// Returns true for statuses that end a stage.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingApproval => "waiting_approval",
        };
        f.write_str(s)
    }
}

/// A single progress update for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage name.
    pub stage: String,
    /// Run session id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Reported status.
    pub status: ProgressStatus,
    /// Progress percentage (0-100).
    pub percent: u8,
    /// Human-readable message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// 1-indexed attempt number.
    pub attempt: usize,
}

impl ProgressEvent {
    /// Creates an event with the status's default percentage.
    #[must_use]
    pub fn new(stage: impl Into<String>, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            session_id: None,
            status,
            percent: status.default_percent(),
            message: message.into(),
            timestamp: iso_timestamp(),
            attempt: 1,
        }
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    /// Overrides the percentage, clamped to 100.
    #[must_use]
    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = percent.min(100);
        self
    }
}
