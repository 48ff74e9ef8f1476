//! Testing utilities for agentflow pipelines.
//!
//! Stage doubles with controllable latency, failures and panics.

mod mocks;

pub use mocks::{
    FailingStage, FlakyStage, PanickingStage, RecordedExecution, RecordingStage, SleepStage,
};
