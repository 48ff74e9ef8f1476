//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications
//! - Pipeline builder with graph validation
//! - The task wrapper (timeout, retry, error conversion)
//! - The DAG scheduler

mod builder;
mod dag;
mod retry;
mod spec;
mod wrapper;


pub use builder::PipelineBuilder;
pub use dag::{Pipeline, RunReport, StageSummary};
pub use retry::{Backoff, BackoffStrategy, JitterStrategy, RetryPolicy};
pub use spec::StageSpec;
pub use wrapper::{truncate_message, StageRun, TaskOutcome, TaskWrapper, MAX_ERROR_MESSAGE_CHARS};
