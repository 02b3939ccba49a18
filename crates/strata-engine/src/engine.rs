use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strata_core::config::AppConfig;
use strata_core::error::{Result, StrataError};
use strata_core::tenant::tenant_scope;
use strata_core::traits::{
    AgentInvoker, ExecutionStore, ExternalResumer, JobClient, StepExecutor, ToolInvoker,
};
use strata_core::types::*;
use strata_core::workflow::{StepKind, WorkflowDefinition};

use crate::approval::ApprovalBroker;
use crate::breaker::CircuitBreakerRegistry;
use crate::context::ExecutionContext;
use crate::graph::prepare;
use crate::registry::StepRegistry;
use crate::retry::{ErrorHandler, ErrorStatistics};
use crate::scheduler::{ExecutionHandle, Scheduler};
use crate::steps::{AgentCallStep, ApprovalStep, ExternalJobStep, ToolCallStep};
use crate::stream::StreamManager;

/// Result of deciding an approval.
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub request: ApprovalRequest,
    /// The execution after an in-process resume; `None` when an external
    /// orchestrator owns the resume.
    pub execution: Option<ExecutionSummary>,
}

/// Assembles a [`WorkflowEngine`] from its collaborators.
pub struct EngineBuilder {
    config: AppConfig,
    registry: StepRegistry,
    store: Option<Arc<dyn ExecutionStore>>,
    resumer: Option<Arc<dyn ExternalResumer>>,
}

impl EngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_resumer(mut self, resumer: Arc<dyn ExternalResumer>) -> Self {
        self.resumer = Some(resumer);
        self
    }

    pub fn with_job_client(mut self, client: Arc<dyn JobClient>) -> Self {
        self.registry
            .register(StepKind::ExternalJob, ExternalJobStep::new(client));
        self
    }

    pub fn with_tool_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.registry.register(StepKind::ToolCall, ToolCallStep::new(invoker));
        self
    }

    pub fn with_agent_invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.registry
            .register(StepKind::AgentCall, AgentCallStep::new(invoker));
        self
    }

    /// Register or replace the executor for one step kind.
    pub fn with_executor(mut self, kind: StepKind, executor: impl StepExecutor) -> Self {
        self.registry.register(kind, executor);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let config = self.config;
        let streams = Arc::new(StreamManager::default());

        let mut broker = ApprovalBroker::new(streams.clone());
        if let Some(store) = &self.store {
            broker = broker.with_store(store.clone());
        }
        let approvals = Arc::new(broker);

        let mut registry = self.registry;
        if !registry.contains(StepKind::Approval) {
            registry.register(
                StepKind::Approval,
                ApprovalStep::new(approvals.clone(), config.engine.approval_backend),
            );
        }
        let registry = Arc::new(registry);

        let breakers = Arc::new(CircuitBreakerRegistry::from_config(&config.breaker));
        let errors = Arc::new(ErrorHandler::new(
            breakers,
            config.breaker.error_history_limit,
        ));

        let mut scheduler = Scheduler::new(
            registry.clone(),
            errors.clone(),
            streams.clone(),
            config.retry.clone(),
            &config.engine,
        );
        if let Some(store) = &self.store {
            scheduler = scheduler.with_store(store.clone());
        }

        WorkflowEngine {
            config,
            registry,
            errors,
            streams,
            approvals,
            scheduler,
            store: self.store,
            resumer: self.resumer,
            executions: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
        }
    }
}

/// `(tenant scope, execution id)`
type ExecutionKey = (String, String);

/// Runs workflows: validation, scheduling, suspension and resume.
///
/// Live executions are held per tenant: a lookup only sees executions created
/// or restored under the same tenant scope.
pub struct WorkflowEngine {
    config: AppConfig,
    registry: Arc<StepRegistry>,
    errors: Arc<ErrorHandler>,
    streams: Arc<StreamManager>,
    approvals: Arc<ApprovalBroker>,
    scheduler: Scheduler,
    store: Option<Arc<dyn ExecutionStore>>,
    resumer: Option<Arc<dyn ExternalResumer>>,
    executions: Mutex<HashMap<ExecutionKey, Arc<ExecutionHandle>>>,
    order: Mutex<VecDeque<ExecutionKey>>,
}

impl WorkflowEngine {
    /// Start a builder with the built-in data steps registered.
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: StepRegistry::with_builtins(),
            store: None,
            resumer: None,
        }
    }

    pub fn new(config: AppConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    /// Normalize and validate a workflow, and check every step type has an executor.
    pub fn validate_workflow(&self, workflow: WorkflowDefinition) -> Result<WorkflowDefinition> {
        let prepared = prepare(workflow)?;
        self.registry.validate(&prepared.kinds())?;
        Ok(prepared)
    }

    /// Create an execution without driving it.
    ///
    /// A null `trigger` seeds nothing, leaving data-source steps to wait
    /// for [`provide_input`](Self::provide_input).
    ///
    /// A workflow that fails validation still gets an execution id; it is
    /// recorded as FAILED before any step runs.
    pub async fn start(&self, workflow: WorkflowDefinition, trigger: Value) -> Result<ExecutionId> {
        let execution_id = ExecutionId::new();
        let workflow_id = workflow.workflow_id.clone();

        let ctx = match self.validate_workflow(workflow) {
            Ok(prepared) => {
                if let Some(store) = &self.store {
                    store.save_workflow(prepared.clone()).await?;
                }
                let mut ctx = ExecutionContext::new(execution_id.clone(), &prepared);
                if !trigger.is_null() {
                    ctx.seed_trigger(trigger);
                }
                ctx.start_execution();
                info!(
                    execution_id = %execution_id,
                    workflow_id = %workflow_id,
                    steps = prepared.steps.len(),
                    "Execution started"
                );
                ctx
            }
            Err(e) => {
                warn!(
                    execution_id = %execution_id,
                    workflow_id = %workflow_id,
                    error = %e,
                    "Workflow rejected"
                );
                ExecutionContext::rejected(execution_id.clone(), &workflow_id, &e)
            }
        };

        self.streams.publish(StreamEvent::new(
            StreamEventType::Status,
            execution_id.to_string(),
            Some(workflow_id),
            json!({ "status": ctx.status.as_str() }),
        ));
        self.remember(ExecutionHandle::new(ctx)).await;
        Ok(execution_id)
    }

    /// Drive an execution created by [`start`](Self::start).
    pub async fn run(&self, execution_id: &str) -> Result<ExecutionSummary> {
        let handle = self.handle(execution_id).await?;
        Ok(self.scheduler.drive(&handle).await)
    }

    /// Start and drive a workflow until it finishes or suspends.
    pub async fn execute(&self, workflow: WorkflowDefinition, trigger: Value) -> Result<ExecutionSummary> {
        let execution_id = self.start(workflow, trigger).await?;
        self.run(execution_id.as_str()).await
    }

    /// Continue a step suspended on an approval with the decision output.
    ///
    /// Steps waiting on an external job are advanced with
    /// [`poll`](Self::poll) instead; resuming them is rejected so the
    /// recorded job handle is never overwritten.
    pub async fn resume(
        &self,
        execution_id: &str,
        step_id: &str,
        decision_output: Value,
    ) -> Result<ExecutionSummary> {
        let handle = self.handle(execution_id).await?;
        {
            let mut ctx = handle.ctx.lock().await;
            if ctx.status.is_terminal() {
                warn!(execution_id, step_id, status = %ctx.status, "Ignoring resume of finished execution");
                return Ok(ctx.summary());
            }
            ensure_awaiting_approval(&ctx, step_id)?;
            ctx.reopen_step(step_id)?;
            ctx.set_step_data(step_id, decision_output)?;
            ctx.resume_execution();
            info!(execution_id, step_id, "Execution resumed");
        }
        Ok(self.scheduler.drive(&handle).await)
    }

    /// Re-invoke every poll-waiting step once. Also the entry point for job callbacks.
    pub async fn poll(&self, execution_id: &str) -> Result<ExecutionSummary> {
        let handle = self.handle(execution_id).await?;
        {
            let mut ctx = handle.ctx.lock().await;
            if ctx.status.is_terminal() {
                warn!(execution_id, status = %ctx.status, "Ignoring poll of finished execution");
                return Ok(ctx.summary());
            }
            for step_id in ctx.waiting_steps(WaitReason::Poll) {
                ctx.reopen_step(&step_id)?;
            }
            ctx.resume_execution();
        }
        Ok(self.scheduler.drive(&handle).await)
    }

    /// Supply data for a pending `input` step.
    pub async fn provide_input(
        &self,
        execution_id: &str,
        step_id: &str,
        data: Value,
    ) -> Result<ExecutionSummary> {
        let handle = self.handle(execution_id).await?;
        {
            let mut ctx = handle.ctx.lock().await;
            if ctx.status.is_terminal() {
                warn!(execution_id, step_id, status = %ctx.status, "Ignoring input for finished execution");
                return Ok(ctx.summary());
            }
            match ctx.step(step_id).map(|s| s.kind) {
                Some(StepKind::Input) => {}
                Some(other) => {
                    return Err(StrataError::Validation(format!(
                        "step '{}' is a {} step, not an input step",
                        step_id, other
                    )))
                }
                None => return Err(StrataError::Validation(format!("unknown step '{}'", step_id))),
            }
            ctx.set_step_data(step_id, data)?;
            ctx.resume_execution();
        }
        Ok(self.scheduler.drive(&handle).await)
    }

    /// Stop scheduling new steps. In-flight steps finish but their results are
    /// dropped, and the execution ends CANCELLED.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionSummary> {
        let handle = self.handle(execution_id).await?;
        handle.cancel.cancel();
        Ok(self.scheduler.drive(&handle).await)
    }

    /// Decide an approval request and hand the decision to its backend.
    pub async fn decide_approval(
        &self,
        request_id: &str,
        decision: ApprovalDecision,
        approved: bool,
    ) -> Result<ApprovalResolution> {
        let pending = self
            .approvals
            .get(request_id)
            .await?
            .ok_or_else(|| StrataError::ApprovalNotFound(request_id.to_string()))?;
        let external = match (pending.backend, &self.resumer) {
            (ApprovalBackend::External, Some(resumer)) => Some(resumer.clone()),
            (ApprovalBackend::External, None) => {
                return Err(StrataError::Configuration(
                    "approval uses the external backend but no resumer is configured".into(),
                ))
            }
            (ApprovalBackend::Local, _) => None,
        };
        if external.is_none() {
            // The execution must be reachable before the decision is spent on it.
            self.handle(&pending.execution_id).await?;
        }

        let request = self.approvals.resolve(request_id, decision, approved).await?;
        let output = ApprovalBroker::decision_output(&request);
        let delivered = match external {
            Some(resumer) => resumer
                .resume(request.execution_id.clone(), request.step_id.clone(), output)
                .await
                .map(|()| None),
            None => self
                .resume(&request.execution_id, &request.step_id, output)
                .await
                .map(Some),
        };
        match delivered {
            Ok(execution) => Ok(ApprovalResolution { request, execution }),
            Err(e) => {
                warn!(
                    approval_id = %request.id,
                    execution_id = %request.execution_id,
                    error = %e,
                    "Approval decision not delivered"
                );
                if let Err(revert_err) = self.approvals.revert(&request.id).await {
                    warn!(approval_id = %request.id, error = %revert_err, "Failed to revert approval");
                }
                Err(e)
            }
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionSummary> {
        Ok(self.handle(execution_id).await?.summary().await)
    }

    /// Full context of an execution, for inspection.
    pub async fn execution_context(&self, execution_id: &str) -> Result<ExecutionContext> {
        Ok(self.handle(execution_id).await?.context().await)
    }

    /// The current tenant's recent executions, newest first, bounded by `history_limit`.
    pub async fn execution_history(&self, limit: usize) -> Vec<ExecutionSummary> {
        let limit = limit.min(self.config.engine.history_limit);
        let scope = tenant_scope();
        let keys: Vec<ExecutionKey> = self
            .order
            .lock()
            .await
            .iter()
            .rev()
            .filter(|(s, _)| *s == scope)
            .take(limit)
            .cloned()
            .collect();
        let handles: Vec<Arc<ExecutionHandle>> = {
            let executions = self.executions.lock().await;
            keys.iter().filter_map(|k| executions.get(k).cloned()).collect()
        };
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries
    }

    /// Compensation data of completed steps, most recent first. Never run automatically.
    pub async fn rollback_plan(&self, execution_id: &str) -> Result<Vec<(String, Value)>> {
        Ok(self.handle(execution_id).await?.ctx.lock().await.rollback_plan())
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        self.errors.error_statistics(None)
    }

    /// Start the stream heartbeat at the configured interval.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.engine.heartbeat_interval_secs.max(1));
        self.streams.spawn_heartbeat(interval, cancel)
    }

    async fn remember(&self, handle: Arc<ExecutionHandle>) {
        let key = (tenant_scope(), handle.ctx.lock().await.execution_id.to_string());
        let mut executions = self.executions.lock().await;
        let mut order = self.order.lock().await;
        if executions.insert(key.clone(), handle).is_some() {
            order.retain(|k| *k != key);
        }
        order.push_back(key);

        let limit = self.config.engine.history_limit.max(1);
        while order.len() > limit {
            if let Some(evicted) = order.pop_front() {
                executions.remove(&evicted);
            }
        }
    }

    /// Find a live execution of the current tenant, or restore it from the store.
    async fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>> {
        let key = (tenant_scope(), execution_id.to_string());
        if let Some(handle) = self.executions.lock().await.get(&key).cloned() {
            return Ok(handle);
        }
        let Some(store) = &self.store else {
            return Err(StrataError::ExecutionNotFound(execution_id.to_string()));
        };
        let record = store
            .load_execution(execution_id.to_string())
            .await?
            .ok_or_else(|| StrataError::ExecutionNotFound(execution_id.to_string()))?;
        let ctx = ExecutionContext::restore(record.snapshot)?;
        info!(execution_id, status = %ctx.status, "Execution restored from store");
        let handle = ExecutionHandle::new(ctx);
        self.remember(handle.clone()).await;
        Ok(handle)
    }
}

fn ensure_awaiting_approval(ctx: &ExecutionContext, step_id: &str) -> Result<()> {
    if ctx.waiting_steps(WaitReason::Approval).iter().any(|s| s == step_id) {
        return Ok(());
    }
    let state = match ctx.step_status(step_id) {
        None => return Err(StrataError::Validation(format!("unknown step '{}'", step_id))),
        Some(StepStatus::Waiting) => match ctx.step_result(step_id).and_then(|r| r.wait_reason) {
            Some(WaitReason::Poll) => "waiting on an external job; poll the execution instead".to_string(),
            _ => "waiting for input; provide input instead".to_string(),
        },
        Some(status) => format!("{}, not awaiting approval", status),
    };
    Err(StrataError::Validation(format!("step '{}' is {}", step_id, state)))
}
