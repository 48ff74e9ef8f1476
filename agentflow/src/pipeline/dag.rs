//! DAG scheduler.
//!
//! Executes stages as soon as their dependencies are met, allowing for
//! maximum parallelism. Each stage's delta is merged into the shared state
//! the moment its wrapper returns; dependents are launched only after that
//! merge, so every stage sees the outputs of all of its dependencies.

use super::spec::StageSpec;
use super::wrapper::{StageRun, TaskOutcome, TaskWrapper};
use crate::errors::StageFault;
use crate::events::ProgressStatus;
use crate::stages::{StageContext, StageServices};
use crate::state::{SharedState, State, StateSchema, SESSION_FIELD};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

type StageTask = BoxFuture<'static, (String, Result<StageRun, JoinError>)>;

/// A stage ready for execution.
#[derive(Debug, Clone)]
pub(crate) struct CompiledStage {
    pub(crate) spec: StageSpec,
    pub(crate) wrapper: TaskWrapper,
}

/// Per-stage entry in a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    /// `Completed` or `Failed`.
    pub status: ProgressStatus,
    /// Attempts made.
    pub attempts: usize,
    /// Wall time including backoff sleeps.
    pub duration_ms: f64,
    /// Final fault message for failed stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The pipeline name.
    pub pipeline: String,
    /// Session id the run was executed under.
    pub session_id: String,
    /// Final merged state.
    pub state: State,
    /// Per-stage summaries.
    pub stages: BTreeMap<String, StageSummary>,
    /// Stage names in the order their deltas were merged.
    pub completion_order: Vec<String>,
    /// Total wall time in milliseconds.
    pub duration_ms: f64,
}

impl RunReport {
    /// Returns true if every stage produced its own delta.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.stages.values().all(|s| s.status == ProgressStatus::Completed)
    }

    /// Names of stages that exhausted their retry budget.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|(_, s)| s.status == ProgressStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Returns the summary for a stage.
    #[must_use]
    pub fn summary(&self, stage: &str) -> Option<&StageSummary> {
        self.stages.get(stage)
    }

    /// Position of a stage in the completion order.
    #[must_use]
    pub fn completion_index(&self, stage: &str) -> Option<usize> {
        self.completion_order.iter().position(|s| s == stage)
    }
}

/// A compiled, validated stage graph.
#[derive(Debug)]
pub struct Pipeline {
    /// The pipeline name.
    name: String,
    /// Compiled stages.
    stages: HashMap<String, CompiledStage>,
    /// Insertion order.
    stage_order: Vec<String>,
    /// Execution order (topologically sorted).
    execution_order: Vec<String>,
    /// Children of each stage, in insertion order.
    dependents: HashMap<String, Vec<String>>,
    schema: Arc<StateSchema>,
    services: StageServices,
}

impl Pipeline {
    pub(crate) fn new(
        name: String,
        stages: HashMap<String, CompiledStage>,
        stage_order: Vec<String>,
        schema: Arc<StateSchema>,
        services: StageServices,
    ) -> Self {
        let execution_order = topological_sort(&stages, &stage_order);

        let mut dependents: HashMap<String, Vec<String>> =
            stage_order.iter().map(|n| (n.clone(), Vec::new())).collect();
        for name in &stage_order {
            for dep in &stages[name].spec.dependencies {
                if let Some(children) = dependents.get_mut(dep) {
                    children.push(name.clone());
                }
            }
        }

        Self {
            name,
            stages,
            stage_order,
            execution_order,
            dependents,
            schema,
            services,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns the merge policies in effect.
    #[must_use]
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Returns the services handed to stages.
    #[must_use]
    pub fn services(&self) -> &StageServices {
        &self.services
    }

    /// Returns the wrapper configured for a stage.
    #[must_use]
    pub fn wrapper(&self, stage: &str) -> Option<&TaskWrapper> {
        self.stages.get(stage).map(|s| &s.wrapper)
    }

    /// Executes the graph and returns the final state.
    ///
    /// The session id is read from the initial state's `session_id` field,
    /// or generated and written there. Stage failures never abort the run;
    /// they surface as entries in the errors field. Approvals still pending
    /// for the session are discarded once every stage has finished.
    pub async fn run(&self, initial: State) -> RunReport {
        let start = Instant::now();

        let mut initial = initial;
        let session_id = initial
            .session_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        initial.insert(SESSION_FIELD, serde_json::Value::String(session_id.clone()));
        let shared = Arc::new(SharedState::new(Arc::clone(&self.schema), initial));

        info!(
            pipeline = %self.name,
            session_id = %session_id,
            stages = self.stages.len(),
            "Pipeline started"
        );

        // Track in-degree (number of unmerged dependencies) for each stage
        let mut in_degree: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|(name, stage)| (name.as_str(), stage.spec.dependencies.len()))
            .collect();

        let mut active_tasks: FuturesUnordered<StageTask> = FuturesUnordered::new();
        for name in &self.stage_order {
            if in_degree.get(name.as_str()) == Some(&0) {
                active_tasks.push(self.spawn_stage_task(name, &session_id, &shared));
            }
        }

        let mut summaries = BTreeMap::new();
        let mut completion_order = Vec::with_capacity(self.stages.len());

        while let Some((stage_name, joined)) = active_tasks.next().await {
            let run = match joined {
                Ok(run) => run,
                Err(e) => self.recover_aborted(&stage_name, &e, &shared),
            };

            summaries.insert(stage_name.clone(), self.summarize(&stage_name, &run));
            completion_order.push(stage_name.clone());

            // Schedule newly ready stages (dependencies merged)
            for child in self.dependents.get(&stage_name).into_iter().flatten() {
                if let Some(count) = in_degree.get_mut(child.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        active_tasks.push(self.spawn_stage_task(child, &session_id, &shared));
                    }
                }
            }
        }

        if completion_order.len() < self.stages.len() {
            let pending: Vec<_> = self
                .stage_order
                .iter()
                .filter(|name| !summaries.contains_key(*name))
                .collect();
            error!(pipeline = %self.name, ?pending, "Stage graph stalled");
        }

        let discarded = self.services.approvals.cleanup(&session_id);
        if discarded > 0 {
            warn!(session_id = %session_id, discarded, "Discarded unresolved approvals");
        }

        let report = RunReport {
            pipeline: self.name.clone(),
            session_id,
            state: shared.snapshot(),
            stages: summaries,
            completion_order,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            pipeline = %self.name,
            session_id = %report.session_id,
            failed = report.failed_stages().len(),
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );
        report
    }

    /// Spawns a task that runs a stage and merges its delta.
    fn spawn_stage_task(&self, stage_name: &str, session_id: &str, shared: &Arc<SharedState>) -> StageTask {
        let stage = &self.stages[stage_name];
        let runner = Arc::clone(&stage.spec.runner);
        let wrapper = stage.wrapper.clone();

        // Dependencies are merged by now; take the input snapshot at launch.
        let snapshot = Arc::new(shared.snapshot());
        let ctx = StageContext::new(stage_name, session_id, snapshot, self.services.clone());
        let shared = Arc::clone(shared);
        let span = info_span!("stage", stage = %stage_name, session_id = %session_id);

        let handle = tokio::spawn(
            async move {
                let run = wrapper.execute(runner.as_ref(), ctx).await;
                shared.merge(&run.delta);
                run
            }
            .instrument(span),
        );

        let stage_name = stage_name.to_string();
        async move { (stage_name, handle.await) }.boxed()
    }

    /// Records a task that died outside the wrapper as a failed stage.
    fn recover_aborted(&self, stage_name: &str, err: &JoinError, shared: &SharedState) -> StageRun {
        error!(stage = %stage_name, error = %err, "Stage task aborted");
        let fault = StageFault::Exception {
            stage: stage_name.to_string(),
            message: format!("task aborted: {err}"),
        };
        let delta = TaskWrapper::error_delta(&fault, 1);
        shared.merge(&delta);
        StageRun {
            outcome: TaskOutcome::Failure { error: fault, attempt: 1 },
            delta,
            attempts: 1,
            duration: Duration::ZERO,
        }
    }

    fn summarize(&self, stage_name: &str, run: &StageRun) -> StageSummary {
        let fault = run.outcome.fault(stage_name);
        StageSummary {
            status: if fault.is_none() {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            },
            attempts: run.attempts,
            duration_ms: run.duration.as_secs_f64() * 1000.0,
            error: fault.map(|f| f.to_string()),
        }
    }
}

/// Performs topological sort on the stage graph.
fn topological_sort(stages: &HashMap<String, CompiledStage>, stage_order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &HashMap<String, CompiledStage>,
        visited: &mut HashSet<String>,
        temp_visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }
        temp_visited.insert(node.to_string());

        if let Some(stage) = stages.get(node) {
            for dep in &stage.spec.dependencies {
                visit(dep, stages, visited, temp_visited, result);
            }
        }

        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut temp_visited = HashSet::new();

    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}
