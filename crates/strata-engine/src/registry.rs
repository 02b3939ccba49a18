use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strata_core::error::{Result, StrataError};
use strata_core::traits::StepExecutor;
use strata_core::types::{StepContext, StepOutcome};
use strata_core::workflow::{StepConfig, StepKind};

use crate::steps::builtin::{DelayStep, MergeStep, SourceStep, TransformStep};

/// Registry mapping each step kind to its executor.
pub struct StepRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for `kind`.
    pub fn register(&mut self, kind: StepKind, executor: impl StepExecutor) {
        self.executors.insert(kind, Arc::new(executor));
    }

    pub fn register_arc(&mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn unregister(&mut self, kind: StepKind) -> bool {
        self.executors.remove(&kind).is_some()
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Registered kinds, sorted by name.
    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.executors.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Fail with a configuration error if any kind lacks an executor.
    pub fn validate(&self, kinds: &[StepKind]) -> Result<()> {
        match kinds.iter().find(|k| !self.contains(**k)) {
            Some(missing) => Err(StrataError::ExecutorNotRegistered(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Execute one invocation, enforcing the step's own timeout if it has one.
    pub async fn execute(
        &self,
        step: StepConfig,
        input: serde_json::Map<String, serde_json::Value>,
        ctx: StepContext,
    ) -> Result<StepOutcome> {
        let executor = self
            .get(step.kind)
            .ok_or_else(|| StrataError::ExecutorNotRegistered(step.kind.to_string()))?;

        match step.timeout_seconds {
            Some(secs) => {
                let step_id = step.step_id.clone();
                match tokio::time::timeout(
                    Duration::from_secs(secs),
                    executor.execute(step, input, ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StrataError::Timeout {
                        operation: format!("step {}", step_id),
                        timeout_secs: secs,
                    }),
                }
            }
            None => executor.execute(step, input, ctx).await,
        }
    }

    /// Create a registry with the built-in data steps registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::Trigger, SourceStep);
        registry.register(StepKind::Input, SourceStep);
        registry.register(StepKind::Transform, TransformStep);
        registry.register(StepKind::Merge, MergeStep);
        registry.register(StepKind::Delay, DelayStep);
        registry
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
