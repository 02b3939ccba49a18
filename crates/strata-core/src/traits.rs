use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;
use crate::workflow::{StepConfig, WorkflowDefinition};

/// Step executor: the uniform callable contract for every step type.
pub trait StepExecutor: Send + Sync + 'static {
    /// Run one invocation of a step.
    ///
    /// `input` holds exactly the keys of the step's resolved input mapping.
    /// `Err` values are classified by the retry layer; `Ok` outcomes with
    /// `success == false` are recorded as they are, without retry.
    fn execute(
        &self,
        step: StepConfig,
        input: serde_json::Map<String, serde_json::Value>,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>>;
}

/// External job service used by two-phase steps.
pub trait JobClient: Send + Sync + 'static {
    fn create_job(&self, request: JobRequest) -> BoxFuture<'_, Result<JobHandle>>;

    fn job_status(&self, job_id: String) -> BoxFuture<'_, Result<JobStatus>>;
}

/// Host-supplied tool runtime behind `tool_call` steps.
pub trait ToolInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        tool: String,
        input: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Host-supplied agent runtime behind `agent_call` steps.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        agent: String,
        input: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Durable orchestrator that resumes runs for the `external` approval backend.
pub trait ExternalResumer: Send + Sync + 'static {
    fn resume(
        &self,
        execution_id: String,
        step_id: String,
        decision_output: serde_json::Value,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Persistence backend for workflows, runs, and approvals.
pub trait ExecutionStore: Send + Sync + 'static {
    fn save_workflow(&self, workflow: WorkflowDefinition) -> BoxFuture<'_, Result<()>>;

    fn load_workflow(&self, workflow_id: String) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;

    fn save_execution(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    fn load_execution(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionRecord>>>;

    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;

    fn save_step_result(
        &self,
        execution_id: String,
        result: StepResult,
    ) -> BoxFuture<'_, Result<()>>;

    fn list_step_results(&self, execution_id: String) -> BoxFuture<'_, Result<Vec<StepResult>>>;

    fn save_approval(&self, request: ApprovalRequest) -> BoxFuture<'_, Result<()>>;

    fn load_approval(&self, id: String) -> BoxFuture<'_, Result<Option<ApprovalRequest>>>;

    fn list_approvals(
        &self,
        status: Option<ApprovalStatus>,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>>;
}
