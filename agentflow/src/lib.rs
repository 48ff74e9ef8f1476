//! # Agentflow
//!
//! An orchestration engine for multi-step agent pipelines.
//!
//! Agentflow runs a dependency graph of long-running, failure-prone stages
//! that collaborate through one shared state object:
//!
//! - **DAG scheduling**: stages start as soon as all of their dependencies
//!   have merged, with parallel fan-out and fan-in barriers
//! - **Merge discipline**: per-field overwrite/append policies make
//!   concurrent writes safe
//! - **Task wrapper**: per-attempt timeouts, exponential backoff, and error
//!   deltas instead of aborted runs
//! - **Approval gate**: stages can suspend on a human decision
//! - **Result cache**: fingerprinted lookups with TTL and a local fallback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agentflow::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("research")
//!     .append_field("findings")
//!     .stage("coordinator", Arc::new(Coordinator), &[])
//!     .stage("web_research", Arc::new(WebResearch), &["coordinator"])
//!     .stage("financial_intel", Arc::new(FinancialIntel), &["coordinator"])
//!     .stage("analyst", Arc::new(Analyst), &["web_research", "financial_intel"])
//!     .build()?;
//!
//! let report = pipeline.run(State::new().with("query", json!("EV batteries"))).await;
//! for (stage, messages) in report.state.errors_by_stage() {
//!     eprintln!("{stage}: {messages:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod approval;
pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod parse;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::approval::{
        ApprovalGate, ApprovalRequest, ApprovalResponse, ApprovalStatus, ApprovalTransport,
        Decision, SubmitOutcome,
    };
    pub use crate::cache::{fingerprint, CacheLayer, CacheStats, SearchFingerprint};
    pub use crate::config::{load_config, EngineConfig};
    pub use crate::errors::{
        AgentflowError, ApprovalError, CacheError, GraphDefinitionError, ParseError, StageFault,
    };
    pub use crate::events::{ProgressEvent, ProgressSink, ProgressStatus};
    pub use crate::parse::{parse_json, parse_json_or};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, RetryPolicy, RunReport, StageSpec};
    pub use crate::stages::{FnStage, Stage, StageContext};
    pub use crate::state::{MergePolicy, State, StateDelta, StateSchema};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
