//! Shared mocks and fixtures for Strata tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use strata_core::config::{AppConfig, TenancyConfig};
use strata_core::error::{Result, StrataError};
use strata_core::traits::{AgentInvoker, ExecutionStore, ExternalResumer, JobClient, ToolInvoker};
use strata_core::types::{
    ApprovalRequest, ApprovalStatus, ExecutionRecord, JobHandle, JobRequest, JobState, JobStatus,
    StepResult,
};
use strata_core::workflow::{StepConfig, StepKind};

/// Shorthand for a step with dependencies.
pub fn step(step_id: &str, kind: StepKind, deps: &[&str]) -> StepConfig {
    StepConfig::new(step_id, kind).with_dependencies(deps.iter().copied())
}

/// Config whose tenant data lives under `dir`.
pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        tenancy: TenancyConfig {
            data_dir: dir.to_string_lossy().into_owned(),
            ..TenancyConfig::default()
        },
        ..AppConfig::default()
    }
}

/// Job service that reports scripted states in order, then repeats the last one.
pub struct MockJobClient {
    requests: Mutex<Vec<JobRequest>>,
    states: Mutex<VecDeque<JobState>>,
    result: Value,
}

impl MockJobClient {
    pub fn new(states: &[JobState]) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            states: Mutex::new(states.iter().copied().collect()),
            result: json!({"ok": true}),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    /// Jobs created so far.
    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl JobClient for MockJobClient {
    fn create_job(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle>> {
        let mut requests = self.requests.lock().unwrap();
        let job_id = format!("job-{}", requests.len());
        requests.push(request);
        Box::pin(async move {
            Ok(JobHandle {
                job_id,
                callback_token: None,
            })
        })
    }

    fn job_status(&self, job_id: String) -> BoxFuture<'_, Result<JobStatus>> {
        let state = {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().unwrap()
            } else {
                states.front().copied().unwrap_or(JobState::Running)
            }
        };
        let (result, error_message) = match state {
            JobState::Succeeded => (Some(self.result.clone()), None),
            JobState::Failed => (None, Some("job failed".to_string())),
            _ => (None, None),
        };
        Box::pin(async move {
            Ok(JobStatus {
                job_id,
                status: state,
                result,
                error_message,
            })
        })
    }
}

/// Tool runtime with canned responses. Unknown tools echo their input.
#[derive(Default)]
pub struct MockToolInvoker {
    responses: HashMap<String, Value>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, tool: &str, response: Value) -> Self {
        self.responses.insert(tool.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolInvoker for MockToolInvoker {
    fn invoke(&self, tool: String, input: Value) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push((tool.clone(), input.clone()));
        let response = self
            .responses
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| json!({ "echo": input }));
        Box::pin(async move { Ok(response) })
    }
}

/// Agent runtime that fails for agents named in `failing`, and answers otherwise.
#[derive(Default)]
pub struct MockAgentInvoker {
    failing: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl MockAgentInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, agent: &str) -> Self {
        self.failing.push(agent.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentInvoker for MockAgentInvoker {
    fn invoke(&self, agent: String, input: Value) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push(agent.clone());
        let fails = self.failing.contains(&agent);
        Box::pin(async move {
            if fails {
                Err(StrataError::NonRetryable(format!("agent {} unavailable", agent)))
            } else {
                Ok(json!({ "agent": agent, "reply": input }))
            }
        })
    }
}

/// Records every resume call made for the external approval backend.
#[derive(Default)]
pub struct RecordingResumer {
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingResumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ExternalResumer for RecordingResumer {
    fn resume(
        &self,
        execution_id: String,
        step_id: String,
        decision_output: Value,
    ) -> BoxFuture<'_, Result<()>> {
        self.calls
            .lock()
            .unwrap()
            .push((execution_id, step_id, decision_output));
        Box::pin(async { Ok(()) })
    }
}

/// In-memory execution store.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    workflows: Mutex<HashMap<String, strata_core::workflow::WorkflowDefinition>>,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    steps: Mutex<HashMap<(String, String), StepResult>>,
    approvals: Mutex<HashMap<String, ApprovalRequest>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save_workflow(
        &self,
        workflow: strata_core::workflow::WorkflowDefinition,
    ) -> BoxFuture<'_, Result<()>> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.workflow_id.clone(), workflow);
        Box::pin(async { Ok(()) })
    }

    fn load_workflow(
        &self,
        workflow_id: String,
    ) -> BoxFuture<'_, Result<Option<strata_core::workflow::WorkflowDefinition>>> {
        let found = self.workflows.lock().unwrap().get(&workflow_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save_execution(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        self.executions
            .lock()
            .unwrap()
            .insert(record.execution_id.clone(), record);
        Box::pin(async { Ok(()) })
    }

    fn load_execution(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let found = self.executions.lock().unwrap().get(&execution_id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        let mut records: Vec<ExecutionRecord> =
            self.executions.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Box::pin(async move { Ok(records) })
    }

    fn save_step_result(
        &self,
        execution_id: String,
        result: StepResult,
    ) -> BoxFuture<'_, Result<()>> {
        self.steps
            .lock()
            .unwrap()
            .insert((execution_id, result.step_id.clone()), result);
        Box::pin(async { Ok(()) })
    }

    fn list_step_results(&self, execution_id: String) -> BoxFuture<'_, Result<Vec<StepResult>>> {
        let mut results: Vec<StepResult> = self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|((exec, _), _)| *exec == execution_id)
            .map(|(_, r)| r.clone())
            .collect();
        results.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Box::pin(async move { Ok(results) })
    }

    fn save_approval(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        self.approvals
            .lock()
            .unwrap()
            .insert(request.id.clone(), request);
        Box::pin(async { Ok(()) })
    }

    fn load_approval(&self, id: String) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        let found = self.approvals.lock().unwrap().get(&id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        let mut requests: Vec<ApprovalRequest> = self
            .approvals
            .lock()
            .unwrap()
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Box::pin(async move { Ok(requests) })
    }
}
