//! Error types for the agentflow engine.
//!
//! Only [`GraphDefinitionError`] is fatal to a pipeline run. Every other error
//! in this module is either converted into state (stage faults), returned to
//! the stage that asked for it (approval errors), or absorbed by a fallback
//! (cache backend errors).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for agentflow operations.
#[derive(Debug, Error)]
pub enum AgentflowError {
    /// The stage graph could not be compiled.
    #[error("{0}")]
    GraphDefinition(#[from] GraphDefinitionError),

    /// An approval gate operation failed.
    #[error("{0}")]
    Approval(#[from] ApprovalError),

    /// A cache backend operation failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A stage attempt failed.
    #[error("{0}")]
    Stage(#[from] StageFault),

    /// Structured output could not be parsed.
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Metadata about a definition error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Structural problem found while compiling a stage graph.
///
/// Raised before any stage executes; the whole run is rejected.
#[derive(Debug, Clone, Error)]
pub enum GraphDefinitionError {
    /// The graph has no stages.
    #[error("Pipeline '{pipeline}' has no stages")]
    Empty {
        /// The pipeline name.
        pipeline: String,
    },

    /// Two stages share a name.
    #[error("Duplicate stage name '{stage}'")]
    DuplicateStage {
        /// The duplicated name.
        stage: String,
    },

    /// A stage depends on a name that was never declared.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    MissingDependency {
        /// The dependent stage.
        stage: String,
        /// The unresolved dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cycle detected in pipeline: {}", path.join(" -> "))]
    Cycle {
        /// Stage names forming the cycle, first name repeated at the end.
        path: Vec<String>,
    },

    /// The errors field was declared with a non-append policy.
    #[error("Errors field '{field}' must use the append merge policy")]
    ErrorsFieldPolicy {
        /// The field name.
        field: String,
    },
}

impl GraphDefinitionError {
    /// Returns the stages involved in the error.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        match self {
            Self::Empty { .. } | Self::ErrorsFieldPolicy { .. } => Vec::new(),
            Self::DuplicateStage { stage } => vec![stage.clone()],
            Self::MissingDependency { stage, dependency } => {
                vec![stage.clone(), dependency.clone()]
            }
            Self::Cycle { path } => path.clone(),
        }
    }

    /// Returns diagnostic info with a stable code and a fix hint.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        let code = match self {
            Self::Empty { .. } => "GRAPH-001-EMPTY",
            Self::DuplicateStage { .. } => "GRAPH-002-DUPLICATE",
            Self::MissingDependency { .. } => "GRAPH-003-MISSING_DEP",
            Self::Cycle { .. } => "GRAPH-004-CYCLE",
            Self::ErrorsFieldPolicy { .. } => "GRAPH-005-ERRORS_POLICY",
        };
        let mut info = ContractErrorInfo::new(code, self.to_string());
        if let Some(hint) = ContractSuggestions::get(code) {
            info = info.with_fix_hint(hint);
        }
        info
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let info = self.error_info();
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(info.code));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("stages".to_string(), serde_json::json!(self.stages()));
        if let Some(hint) = info.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

/// Provides default suggestions for graph definition error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "GRAPH-001-EMPTY" => Some("Add at least one stage to the pipeline before building."),
            "GRAPH-002-DUPLICATE" => Some("Stage names must be unique within a pipeline."),
            "GRAPH-003-MISSING_DEP" => Some(
                "Ensure all dependencies reference stages that exist in the pipeline. \
                 Check for typos in stage names.",
            ),
            "GRAPH-004-CYCLE" => Some(
                "Check your stage dependencies for circular references. \
                 Use a linear chain or fan-out pattern instead.",
            ),
            "GRAPH-005-ERRORS_POLICY" => Some(
                "Stage failures from sibling stages are accumulated; declare the errors field as append.",
            ),
            _ => None,
        }
    }
}

/// Failure of a single stage attempt.
#[derive(Debug, Clone, Error)]
pub enum StageFault {
    /// The attempt exceeded its timeout.
    #[error("{stage} timed out after {}s", timeout.as_secs_f64())]
    Timeout {
        /// The stage name.
        stage: String,
        /// The per-attempt timeout.
        timeout: Duration,
    },

    /// The task body returned an error or panicked.
    #[error("{stage} error: {message}")]
    Exception {
        /// The stage name.
        stage: String,
        /// The error message.
        message: String,
    },
}

impl StageFault {
    /// Returns a stable machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "stage_timeout",
            Self::Exception { .. } => "stage_exception",
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::Timeout { stage, .. } | Self::Exception { stage, .. } => stage,
        }
    }
}

/// Errors raised by the approval gate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApprovalError {
    /// An approval with this id already exists for the session.
    #[error("Approval '{approval_id}' already exists for session '{session_id}'")]
    Duplicate {
        /// The session id.
        session_id: String,
        /// The approval id.
        approval_id: String,
    },

    /// No approval with this id exists for the session.
    #[error("Approval '{approval_id}' not found for session '{session_id}'")]
    NotFound {
        /// The session id.
        session_id: String,
        /// The approval id.
        approval_id: String,
    },

    /// The approval already reached a terminal state.
    #[error("Approval '{approval_id}' is already {status}")]
    AlreadyResolved {
        /// The approval id.
        approval_id: String,
        /// The terminal status.
        status: String,
    },

    /// Another caller is already waiting on this approval.
    #[error("Approval '{approval_id}' already has a waiter")]
    AlreadyWaiting {
        /// The approval id.
        approval_id: String,
    },

    /// No response arrived before the timeout.
    #[error("Approval '{approval_id}' timed out after {timeout_seconds}s")]
    Timeout {
        /// The approval id.
        approval_id: String,
        /// The timeout in seconds.
        timeout_seconds: f64,
    },

    /// The session was cleaned up while a waiter was blocked.
    #[error("Approval '{approval_id}' was cancelled")]
    Cancelled {
        /// The approval id.
        approval_id: String,
    },
}

/// Errors raised by cache backends.
///
/// The cache layer absorbs these and falls back to local storage.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A stored entry could not be encoded or decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Errors raised when parsing structured model output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The input contained no JSON object or array.
    #[error("No JSON value found in text")]
    NoJson,

    /// A candidate was found but could not be repaired.
    #[error("Invalid JSON: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_cycle_error_message() {
        let err = GraphDefinitionError::Cycle {
            path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.error_info().code, "GRAPH-004-CYCLE");
        assert_eq!(err.stages().len(), 4);
    }

    #[test]
    fn test_missing_dependency_to_dict() {
        let err = GraphDefinitionError::MissingDependency {
            stage: "analyst".into(),
            dependency: "reseach_a".into(),
        };
        let dict = err.to_dict();

        assert_eq!(dict.get("code").unwrap(), "GRAPH-003-MISSING_DEP");
        assert!(dict.contains_key("fix_hint"));
        assert_eq!(dict.get("stages").unwrap(), &serde_json::json!(["analyst", "reseach_a"]));
    }

    #[test]
    fn test_stage_fault_kind() {
        let timeout = StageFault::Timeout {
            stage: "web_research".into(),
            timeout: Duration::from_secs(120),
        };
        let exception = StageFault::Exception {
            stage: "web_research".into(),
            message: "quota exceeded".into(),
        };

        assert_eq!(timeout.kind(), "stage_timeout");
        assert_eq!(timeout.to_string(), "web_research timed out after 120s");
        assert_eq!(exception.kind(), "stage_exception");
        assert_eq!(exception.stage(), "web_research");
    }

    #[test]
    fn test_errors_aggregate() {
        let err: AgentflowError = ApprovalError::Cancelled {
            approval_id: "x".into(),
        }
        .into();
        assert!(matches!(err, AgentflowError::Approval(_)));
    }

    #[test]
    fn test_contract_suggestions() {
        assert!(ContractSuggestions::get("GRAPH-004-CYCLE").is_some());
        assert!(ContractSuggestions::get("UNKNOWN").is_none());
    }
}
