use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::types::*;
use strata_core::workflow::{MergeMode, StepConfig, StepKind, WorkflowDefinition, TRIGGER_RAW_KEY};

use crate::condition::lookup_path;
use crate::graph::dependency_graph;

/// Per-run mutable state: graph, step states, step outputs, and globals.
///
/// Mutated only by the scheduler loop (and by resume/input entry points on
/// the engine). Once the run is terminal every `mark_*` call is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub wait_reason: Option<WaitReason>,
    #[serde(default)]
    pub current_step: Option<String>,
    steps: Vec<StepConfig>,
    dependency_graph: HashMap<String, Vec<String>>,
    states: HashMap<String, StepStatus>,
    step_results: HashMap<String, StepResult>,
    step_io_data: HashMap<String, Value>,
    global_variables: Map<String, Value>,
    metadata: Map<String, Value>,
    completion_order: Vec<String>,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Build a context for a prepared (normalized and validated) workflow.
    pub fn new(execution_id: ExecutionId, workflow: &WorkflowDefinition) -> Self {
        let states = workflow
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepStatus::Pending))
            .collect();
        Self {
            execution_id,
            workflow_id: workflow.workflow_id.clone(),
            status: ExecutionStatus::Pending,
            wait_reason: None,
            current_step: None,
            steps: workflow.steps.clone(),
            dependency_graph: dependency_graph(&workflow.steps),
            states,
            step_results: HashMap::new(),
            step_io_data: HashMap::new(),
            global_variables: workflow.global_variables.clone(),
            metadata: Map::new(),
            completion_order: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// A run that failed before any step could be scheduled.
    pub fn rejected(execution_id: ExecutionId, workflow_id: &str, error: &StrataError) -> Self {
        let mut ctx = Self::new(execution_id, &WorkflowDefinition::new(workflow_id, Vec::new()));
        ctx.start_execution();
        ctx.fail_execution(&error.to_string());
        ctx
    }

    // -- queries ---------------------------------------------------------

    pub fn steps(&self) -> &[StepConfig] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn dependency_graph(&self) -> &HashMap<String, Vec<String>> {
        &self.dependency_graph
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.states.get(step_id).copied()
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results.values()
    }

    pub fn step_io_data(&self) -> &HashMap<String, Value> {
        &self.step_io_data
    }

    pub fn global_variables(&self) -> &Map<String, Value> {
        &self.global_variables
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get("error_message").and_then(|v| v.as_str())
    }

    fn ids_with(&self, status: StepStatus) -> HashSet<String> {
        self.states
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn pending_steps(&self) -> HashSet<String> {
        self.ids_with(StepStatus::Pending)
    }

    pub fn completed_steps(&self) -> HashSet<String> {
        self.ids_with(StepStatus::Completed)
    }

    /// Steps suspended for the given reason, in declaration order.
    pub fn waiting_steps(&self, reason: WaitReason) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| self.step_status(&s.step_id) == Some(StepStatus::Waiting))
            .filter(|s| {
                self.step_results
                    .get(&s.step_id)
                    .and_then(|r| r.wait_reason)
                    == Some(reason)
            })
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn has_status(&self, status: StepStatus) -> bool {
        self.states.values().any(|s| *s == status)
    }

    /// No step is pending, running, or waiting.
    pub fn all_steps_settled(&self) -> bool {
        !self.has_status(StepStatus::Pending)
            && !self.has_status(StepStatus::Running)
            && !self.has_status(StepStatus::Waiting)
    }

    fn is_completed(&self, step_id: &str) -> bool {
        self.step_status(step_id) == Some(StepStatus::Completed)
    }

    fn is_blocked(&self, step_id: &str) -> bool {
        matches!(
            self.step_status(step_id),
            Some(StepStatus::Failed) | Some(StepStatus::Skipped)
        )
    }

    fn has_source_data(&self, step_id: &str) -> bool {
        self.step_io_data.contains_key(step_id) || self.step_io_data.contains_key(TRIGGER_RAW_KEY)
    }

    // -- readiness -------------------------------------------------------

    /// Whether a step's readiness rule is satisfied, ignoring its own state.
    pub fn can_execute_step(&self, step_id: &str) -> bool {
        let Some(step) = self.step(step_id) else {
            return false;
        };
        let deps = &step.dependencies;
        match step.kind {
            StepKind::Trigger | StepKind::Input => self.has_source_data(step_id),
            StepKind::Merge => match step.merge_mode().unwrap_or_default() {
                MergeMode::FirstAvailable => {
                    deps.is_empty() || deps.iter().any(|d| self.is_completed(d))
                }
                MergeMode::WaitAll => deps.iter().all(|d| self.is_completed(d)),
            },
            _ => deps.iter().all(|d| self.is_completed(d)),
        }
    }

    /// Pending steps whose readiness rule holds, in declaration order.
    pub fn get_ready_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| self.step_status(&s.step_id) == Some(StepStatus::Pending))
            .filter(|s| self.can_execute_step(&s.step_id))
            .map(|s| s.step_id.clone())
            .collect()
    }

    /// Pending input steps that still lack data.
    pub fn starved_input_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.kind == StepKind::Input)
            .filter(|s| self.step_status(&s.step_id) == Some(StepStatus::Pending))
            .filter(|s| !self.has_source_data(&s.step_id))
            .map(|s| s.step_id.clone())
            .collect()
    }

    // -- input resolution ------------------------------------------------

    /// Resolve a step's input mapping.
    ///
    /// The result holds only keys of the step's effective input mapping.
    /// Unresolvable entries are dropped and logged.
    pub fn get_step_input_data(&self, step_id: &str) -> Map<String, Value> {
        let mut input = Map::new();
        let Some(step) = self.step(step_id) else {
            return input;
        };
        for (param, source) in step.effective_input_mapping() {
            match self.resolve_source(&source) {
                Some(value) => {
                    input.insert(param, value);
                }
                None => {
                    debug!(step_id, param = %param, source = %source, "Dropping unresolved input mapping");
                }
            }
        }
        input
    }

    fn resolve_source(&self, source: &str) -> Option<Value> {
        if let Some(value) = self.step_output(source) {
            return Some(value.clone());
        }
        if let Some((head, path)) = source.split_once('.') {
            if let Some(root) = self.step_output(head) {
                return lookup_path(root, path).cloned();
            }
        }
        if let Some(value) = self.global_variables.get(source) {
            return Some(value.clone());
        }
        if let Some((head, path)) = source.split_once('.') {
            if let Some(root) = self.global_variables.get(head) {
                return lookup_path(root, path).cloned();
            }
        }
        None
    }

    /// Output visible to other steps: completed steps only, or raw non-step data.
    fn step_output(&self, key: &str) -> Option<&Value> {
        if self.states.contains_key(key) && !self.is_completed(key) {
            return None;
        }
        self.step_io_data.get(key)
    }

    /// Data recorded for this step by earlier invocations.
    ///
    /// Trigger and input steps fall back to the `trigger_raw` sentinel.
    pub fn prior_output(&self, step_id: &str) -> Option<Value> {
        if let Some(value) = self.step_io_data.get(step_id) {
            return Some(value.clone());
        }
        match self.step(step_id).map(|s| s.kind) {
            Some(kind) if kind.is_data_source() => self.step_io_data.get(TRIGGER_RAW_KEY).cloned(),
            _ => None,
        }
    }

    /// Seed trigger data: at the trigger step's id, else the legacy sentinel.
    pub fn seed_trigger(&mut self, data: Value) {
        let trigger = self
            .steps
            .iter()
            .find(|s| s.kind == StepKind::Trigger)
            .map(|s| s.step_id.clone());
        let key = trigger.unwrap_or_else(|| TRIGGER_RAW_KEY.to_string());
        self.step_io_data.insert(key, data);
    }

    /// Record externally supplied data for a step.
    pub fn set_step_data(&mut self, step_id: &str, data: Value) -> Result<()> {
        if self.status.is_terminal() {
            return Err(StrataError::Validation(format!(
                "execution {} is {}",
                self.execution_id, self.status
            )));
        }
        if !self.states.contains_key(step_id) {
            return Err(StrataError::Validation(format!("unknown step '{}'", step_id)));
        }
        self.step_io_data.insert(step_id.to_string(), data);
        Ok(())
    }

    // -- step transitions ------------------------------------------------

    fn result_mut(&mut self, step_id: &str) -> &mut StepResult {
        self.step_results
            .entry(step_id.to_string())
            .or_insert_with(|| StepResult::new(step_id, StepStatus::Pending))
    }

    pub fn mark_running(&mut self, step_id: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.states.insert(step_id.to_string(), StepStatus::Running);
        self.current_step = Some(step_id.to_string());
        let result = self.result_mut(step_id);
        result.status = StepStatus::Running;
        result.error = None;
        result.wait_reason = None;
        result.started_at = Some(Utc::now());
        result.completed_at = None;
    }

    fn finish_result(&mut self, step_id: &str, status: StepStatus, attempts: u32) -> &mut StepResult {
        let now = Utc::now();
        let result = self.result_mut(step_id);
        result.status = status;
        result.attempts = attempts;
        result.completed_at = Some(now);
        result.execution_time_ms = result
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        result
    }

    /// Record output, then flip the completion flag.
    pub fn mark_completed(
        &mut self,
        step_id: &str,
        output: Value,
        rollback_data: Option<Value>,
        attempts: u32,
    ) {
        if self.status.is_terminal() {
            return;
        }
        self.step_io_data.insert(step_id.to_string(), output.clone());
        let result = self.finish_result(step_id, StepStatus::Completed, attempts);
        result.output_data = Some(output);
        result.rollback_data = rollback_data;
        result.error = None;
        self.states.insert(step_id.to_string(), StepStatus::Completed);
        self.completion_order.push(step_id.to_string());
    }

    pub fn mark_failed(&mut self, step_id: &str, error: &str, attempts: u32) {
        if self.status.is_terminal() {
            return;
        }
        let result = self.finish_result(step_id, StepStatus::Failed, attempts);
        result.error = Some(error.to_string());
        self.states.insert(step_id.to_string(), StepStatus::Failed);
    }

    /// Park a step; `output` becomes its prior output for the next invocation.
    pub fn mark_waiting(&mut self, step_id: &str, reason: WaitReason, output: Value, attempts: u32) {
        if self.status.is_terminal() {
            return;
        }
        self.step_io_data.insert(step_id.to_string(), output.clone());
        let result = self.result_mut(step_id);
        result.status = StepStatus::Waiting;
        result.wait_reason = Some(reason);
        result.output_data = Some(output);
        result.attempts = attempts;
        self.states.insert(step_id.to_string(), StepStatus::Waiting);
    }

    pub fn skip_step(&mut self, step_id: &str, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        let result = self.result_mut(step_id);
        result.status = StepStatus::Skipped;
        result.error = Some(reason.to_string());
        result.completed_at = Some(Utc::now());
        self.states.insert(step_id.to_string(), StepStatus::Skipped);
    }

    /// Put a waiting step back into the pending set.
    pub fn reopen_step(&mut self, step_id: &str) -> Result<()> {
        match self.step_status(step_id) {
            Some(StepStatus::Waiting) => {
                self.states.insert(step_id.to_string(), StepStatus::Pending);
                let result = self.result_mut(step_id);
                result.status = StepStatus::Pending;
                result.wait_reason = None;
                Ok(())
            }
            Some(other) => Err(StrataError::Validation(format!(
                "step '{}' is {}, not waiting",
                step_id, other
            ))),
            None => Err(StrataError::Validation(format!("unknown step '{}'", step_id))),
        }
    }

    /// Skip pending steps that can no longer become ready. Returns the ids skipped.
    pub fn propagate_skips(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let mut newly: Vec<(String, String)> = Vec::new();
            for step in &self.steps {
                if self.step_status(&step.step_id) != Some(StepStatus::Pending)
                    || step.kind.is_data_source()
                    || step.dependencies.is_empty()
                {
                    continue;
                }
                let blocked: Vec<&String> = step
                    .dependencies
                    .iter()
                    .filter(|d| self.is_blocked(d))
                    .collect();
                let unreachable = match step.kind {
                    StepKind::Merge
                        if step.merge_mode().unwrap_or_default() == MergeMode::FirstAvailable =>
                    {
                        blocked.len() == step.dependencies.len()
                    }
                    _ => !blocked.is_empty(),
                };
                if unreachable {
                    let reason = format!("dependency '{}' did not complete", blocked[0]);
                    newly.push((step.step_id.clone(), reason));
                }
            }
            if newly.is_empty() {
                break;
            }
            for (id, reason) in newly {
                self.skip_step(&id, &reason);
                skipped.push(id);
            }
        }
        skipped
    }

    // -- execution transitions -------------------------------------------

    pub fn start_execution(&mut self) {
        self.status = ExecutionStatus::Running;
        self.wait_reason = None;
        if !self.metadata.contains_key("started_at") {
            self.metadata
                .insert("started_at".into(), json!(Utc::now().to_rfc3339()));
        }
    }

    /// Clear a suspension and continue scheduling.
    pub fn resume_execution(&mut self) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Running;
            self.wait_reason = None;
        }
    }

    pub fn suspend(&mut self, reason: WaitReason) {
        if !self.status.is_terminal() {
            self.status = ExecutionStatus::Waiting;
            self.wait_reason = Some(reason);
        }
    }

    pub fn complete_execution(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Completed;
        self.wait_reason = None;
        self.current_step = None;
        self.stamp_end("completed_at");
    }

    pub fn fail_execution(&mut self, error: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Failed;
        self.wait_reason = None;
        self.metadata.insert("error_message".into(), json!(error));
        self.stamp_end("failed_at");
    }

    pub fn cancel_execution(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Cancelled;
        self.wait_reason = None;
        self.stamp_end("cancelled_at");
    }

    fn stamp_end(&mut self, key: &str) {
        let now = Utc::now();
        self.metadata.insert(key.into(), json!(now.to_rfc3339()));
        let started = self
            .metadata
            .get("started_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
        if let Some(started) = started {
            let ms = (now - started.with_timezone(&Utc)).num_milliseconds().max(0);
            self.metadata.insert("duration_ms".into(), json!(ms));
        }
    }

    // -- views -----------------------------------------------------------

    /// JSON object used to evaluate step conditions.
    pub fn condition_context(&self) -> Value {
        let mut ctx = Map::new();
        ctx.insert(
            "workflow".into(),
            json!({
                "id": self.workflow_id,
                "status": self.status.as_str(),
                "current_step": self.current_step,
            }),
        );
        ctx.insert("global".into(), Value::Object(self.global_variables.clone()));
        for step in &self.steps {
            let status = self.step_status(&step.step_id).unwrap_or(StepStatus::Pending);
            let result = self.step_results.get(&step.step_id);
            let output = if status == StepStatus::Completed {
                self.step_io_data.get(&step.step_id).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            ctx.insert(
                step.step_id.clone(),
                json!({
                    "status": status.as_str(),
                    "output": output,
                    "error": result.and_then(|r| r.error.clone()),
                }),
            );
        }
        Value::Object(ctx)
    }

    pub fn summary(&self) -> ExecutionSummary {
        let mut step_counts: HashMap<StepStatus, usize> = HashMap::new();
        for status in self.states.values() {
            *step_counts.entry(*status).or_default() += 1;
        }
        let total = self.states.len();
        let settled = self
            .states
            .values()
            .filter(|s| {
                matches!(
                    s,
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
                )
            })
            .count();
        ExecutionSummary {
            execution_id: self.execution_id.to_string(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            wait_reason: self.wait_reason,
            total_steps: total,
            step_counts,
            progress: if total == 0 {
                0.0
            } else {
                settled as f64 / total as f64
            },
            current_step: self.current_step.clone(),
            error_message: self.error_message().map(str::to_string),
            duration_ms: self.metadata.get("duration_ms").and_then(|v| v.as_u64()),
        }
    }

    /// `(step_id, rollback_data)` of completed steps, most recent first.
    pub fn rollback_plan(&self) -> Vec<(String, Value)> {
        self.completion_order
            .iter()
            .rev()
            .filter_map(|id| {
                self.step_results
                    .get(id)
                    .and_then(|r| r.rollback_data.clone())
                    .map(|data| (id.clone(), data))
            })
            .collect()
    }

    pub fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn restore(snapshot: Value) -> Result<Self> {
        Ok(serde_json::from_value(snapshot)?)
    }

    pub fn to_record(&self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            execution_id: self.execution_id.to_string(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            error_message: self.error_message().map(str::to_string),
            snapshot: self.snapshot()?,
            created_at: self.created_at,
            updated_at: Utc::now(),
        })
    }
}
