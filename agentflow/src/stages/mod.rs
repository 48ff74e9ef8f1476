//! Stage trait and implementations.
//!
//! A stage is the task body of one pipeline node. It reads its input
//! snapshot from the [`StageContext`] and returns a [`StateDelta`]; any error
//! it returns (or panic it raises) is handled by the task wrapper.

mod context;

pub use context::{StageContext, StageServices};

use crate::state::StateDelta;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;

/// Trait for pipeline task bodies.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Runs one attempt.
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StateDelta>;
}

/// A stage backed by an async closure.
///
/// The closure receives an owned context clone, so the returned future can
/// be `'static`.
pub struct FnStage<F> {
    label: String,
    func: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StateDelta>> + Send,
{
    /// Creates a new closure stage.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("label", &self.label).finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StateDelta>> + Send,
{
    async fn run(&self, ctx: &StageContext) -> anyhow::Result<StateDelta> {
        (self.func)(ctx.clone()).await
    }
}

/// A stage that returns an empty delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStage;

#[async_trait]
impl Stage for NoOpStage {
    async fn run(&self, _ctx: &StageContext) -> anyhow::Result<StateDelta> {
        Ok(StateDelta::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use serde_json::json;
    use std::sync::Arc;

    fn test_context() -> StageContext {
        let state = State::new().with("query", json!("battery supply chain"));
        StageContext::new("test", "s-1", Arc::new(state), StageServices::default())
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("echo", |ctx: StageContext| async move {
            let query = ctx.state().get_str("query").unwrap_or_default().to_string();
            Ok(StateDelta::single("echo", json!(query)))
        });

        let delta = stage.run(&test_context()).await.unwrap();
        assert_eq!(delta.get("echo"), Some(&json!("battery supply chain")));
        assert!(format!("{stage:?}").contains("echo"));
    }

    #[tokio::test]
    async fn test_fn_stage_error() {
        let stage = FnStage::new("boom", |_ctx| async { Err(anyhow::anyhow!("quota exceeded")) });

        let err = stage.run(&test_context()).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[tokio::test]
    async fn test_noop_stage() {
        let delta = NoOpStage.run(&test_context()).await.unwrap();
        assert!(delta.is_empty());
    }
}
