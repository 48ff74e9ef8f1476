//! Pipeline builder with validation.

use super::dag::{CompiledStage, Pipeline};
use super::retry::RetryPolicy;
use super::spec::StageSpec;
use super::wrapper::TaskWrapper;
use crate::approval::ApprovalGate;
use crate::cache::CacheLayer;
use crate::config::EngineConfig;
use crate::errors::GraphDefinitionError;
use crate::events::ProgressSink;
use crate::stages::{Stage, StageServices};
use crate::state::{MergePolicy, StateSchema, ERRORS_FIELD};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builder for creating validated pipelines.
///
/// Stages may be declared in any order. Structural checks run in
/// [`PipelineBuilder::build`], before anything executes.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Stage specifications in insertion order.
    stages: Vec<StageSpec>,
    /// Merge policies for declared fields.
    schema: StateSchema,
    /// Services handed to every stage.
    services: StageServices,
    /// Default per-attempt timeout.
    timeout: Duration,
    /// Default retry policy.
    retry: RetryPolicy,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder with built-in defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &EngineConfig::default())
    }

    /// Creates a builder whose defaults and services come from configuration.
    #[must_use]
    pub fn from_config(name: impl Into<String>, config: &EngineConfig) -> Self {
        let services = StageServices {
            approvals: Arc::new(ApprovalGate::from_config(&config.approval)),
            cache: Arc::new(CacheLayer::from_config(&config.cache)),
            ..StageServices::default()
        };
        Self {
            name: name.into(),
            stages: Vec::new(),
            schema: StateSchema::new(),
            services,
            timeout: config.stage.timeout(),
            retry: config.stage.retry_policy(),
        }
    }

    /// Adds a stage to the pipeline.
    #[must_use]
    pub fn stage(self, name: impl Into<String>, runner: Arc<dyn Stage>, dependencies: &[&str]) -> Self {
        let spec = StageSpec::new(name, runner).with_dependencies(dependencies.iter().copied());
        self.add_stage_spec(spec)
    }

    /// Adds a fully specified stage.
    #[must_use]
    pub fn add_stage_spec(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Replaces the state schema.
    #[must_use]
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Declares a field whose deltas are concatenated.
    #[must_use]
    pub fn append_field(mut self, field: impl Into<String>) -> Self {
        self.schema.declare(field, MergePolicy::Append);
        self
    }

    /// Declares a field whose deltas replace the previous value.
    #[must_use]
    pub fn overwrite_field(mut self, field: impl Into<String>) -> Self {
        self.schema.declare(field, MergePolicy::Overwrite);
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Shares an approval gate with the caller.
    #[must_use]
    pub fn with_approvals(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.services.approvals = gate;
        self
    }

    /// Shares a cache layer with the caller.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.services.cache = cache;
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.services.progress = sink;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of declared stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the graph and compiles it.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphDefinitionError`] for an empty graph, duplicate names,
    /// unknown dependencies, cycles, or an errors field declared as overwrite.
    pub fn build(self) -> Result<Pipeline, GraphDefinitionError> {
        if self.stages.is_empty() {
            return Err(GraphDefinitionError::Empty { pipeline: self.name });
        }

        let mut stage_order = Vec::with_capacity(self.stages.len());
        let mut stages: HashMap<String, StageSpec> = HashMap::with_capacity(self.stages.len());
        for spec in self.stages {
            if stages.contains_key(&spec.name) {
                return Err(GraphDefinitionError::DuplicateStage { stage: spec.name });
            }
            stage_order.push(spec.name.clone());
            stages.insert(spec.name.clone(), spec);
        }

        for name in &stage_order {
            let spec = &stages[name];
            if let Some(dep) = spec.dependencies.iter().find(|d| !stages.contains_key(*d)) {
                return Err(GraphDefinitionError::MissingDependency {
                    stage: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if let Some(path) = detect_cycle(&stages, &stage_order) {
            return Err(GraphDefinitionError::Cycle { path });
        }

        let mut schema = self.schema;
        match schema.declared(ERRORS_FIELD) {
            Some(MergePolicy::Overwrite) => {
                return Err(GraphDefinitionError::ErrorsFieldPolicy {
                    field: ERRORS_FIELD.to_string(),
                });
            }
            Some(MergePolicy::Append) => {}
            None => schema.declare(ERRORS_FIELD, MergePolicy::Append),
        }

        let compiled = stages
            .into_iter()
            .map(|(name, spec)| {
                let wrapper = TaskWrapper::new(
                    spec.timeout.unwrap_or(self.timeout),
                    spec.effective_retry(&self.retry),
                );
                (name, CompiledStage { spec, wrapper })
            })
            .collect();

        debug!(pipeline = %self.name, stages = stage_order.len(), "Pipeline compiled");
        Ok(Pipeline::new(
            self.name,
            compiled,
            stage_order,
            Arc::new(schema),
            self.services,
        ))
    }
}

/// Returns the first cycle found, as a path whose last name repeats the first.
fn detect_cycle<'a>(
    stages: &'a HashMap<String, StageSpec>,
    stage_order: &'a [String],
) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in stage_order {
        if !visited.contains(name.as_str()) {
            if let Some(cycle) = dfs_cycle(stages, name, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    stages: &'a HashMap<String, StageSpec>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(spec) = stages.get(node) {
        for dep in &spec.dependencies {
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = dfs_cycle(stages, dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep.as_str()) {
                let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}
