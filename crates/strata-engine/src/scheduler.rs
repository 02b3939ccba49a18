//! The per-execution orchestration loop.
//!
//! One driver at a time owns an execution: it computes the ready set under the
//! context lock, releases the lock while the batch runs, then applies every
//! result before deciding what happens next. Cancellation is observed only at
//! these dispatch boundaries; a batch that finishes after its execution was
//! cancelled has its results discarded.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::config::{EngineConfig, RetryConfig};
use strata_core::error::{Result, StrataError};
use strata_core::traits::ExecutionStore;
use strata_core::types::*;
use strata_core::workflow::StepConfig;

use crate::condition::evaluate_condition;
use crate::context::ExecutionContext;
use crate::registry::StepRegistry;
use crate::retry::{ErrorHandler, ErrorScope};
use crate::stream::StreamManager;

/// Shared state for one live execution.
pub struct ExecutionHandle {
    pub(crate) ctx: Mutex<ExecutionContext>,
    drive: Mutex<()>,
    pub(crate) cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(ctx: ExecutionContext) -> Arc<Self> {
        Arc::new(Self {
            ctx: Mutex::new(ctx),
            drive: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn summary(&self) -> ExecutionSummary {
        self.ctx.lock().await.summary()
    }

    /// A point-in-time copy of the context.
    pub async fn context(&self) -> ExecutionContext {
        self.ctx.lock().await.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One step handed to an executor.
struct Dispatch {
    step: StepConfig,
    input: Map<String, Value>,
    ctx: StepContext,
}

/// What an executor invocation produced, after retries.
struct Finished {
    step_id: String,
    critical: bool,
    component: String,
    result: Result<StepOutcome>,
    attempts: u32,
}

enum Next {
    Dispatch(Vec<Dispatch>),
    Sleep,
    Stop,
}

pub struct Scheduler {
    registry: Arc<StepRegistry>,
    errors: Arc<ErrorHandler>,
    streams: Arc<StreamManager>,
    store: Option<Arc<dyn ExecutionStore>>,
    retry: RetryConfig,
    max_concurrent_steps: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StepRegistry>,
        errors: Arc<ErrorHandler>,
        streams: Arc<StreamManager>,
        retry: RetryConfig,
        engine: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            errors,
            streams,
            store: None,
            retry,
            max_concurrent_steps: engine.max_concurrent_steps.max(1),
            poll_interval: Duration::from_millis(engine.poll_interval_ms),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Retry settings for one step: configured defaults overridden per step.
    pub fn retry_config_for(&self, step: &StepConfig) -> RetryConfig {
        let mut config = self.retry.clone();
        config.max_attempts = step.max_retries + 1;
        if let Some(strategy) = step.retry_strategy {
            config.strategy = strategy;
        }
        if let Some(delay) = step.retry_delay_seconds {
            config.base_delay_secs = delay;
        }
        if let Some(max_delay) = step.max_retry_delay_seconds {
            config.max_delay_secs = max_delay;
        }
        config
    }

    /// Drive an execution until it finishes, suspends, or is cancelled.
    pub async fn drive(&self, handle: &ExecutionHandle) -> ExecutionSummary {
        let _driving = handle.drive.lock().await;
        loop {
            let next = {
                let mut ctx = handle.ctx.lock().await;
                self.next_action(&mut ctx, &handle.cancel)
            };
            match next {
                Next::Dispatch(batch) => {
                    let finished = join_all(batch.into_iter().map(|d| self.run_step(d))).await;
                    let mut ctx = handle.ctx.lock().await;
                    if handle.cancel.is_cancelled() {
                        self.discard(&mut ctx, &finished);
                    } else {
                        self.apply(&mut ctx, &finished);
                    }
                    self.persist(&ctx, &finished).await;
                }
                Next::Sleep => {
                    debug!(
                        poll_interval_ms = self.poll_interval.as_millis() as u64,
                        "Waiting before re-polling steps"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = handle.cancel.cancelled() => {}
                    }
                    let mut ctx = handle.ctx.lock().await;
                    for step_id in ctx.waiting_steps(WaitReason::Poll) {
                        if let Err(e) = ctx.reopen_step(&step_id) {
                            debug!(execution_id = %ctx.execution_id, step_id = %step_id, error = %e, "Could not reopen polled step");
                        }
                    }
                }
                Next::Stop => break,
            }
        }

        let ctx = handle.ctx.lock().await;
        self.persist(&ctx, &[]).await;
        self.publish_status(&ctx);
        ctx.summary()
    }

    /// Decide the next move while holding the context lock.
    fn next_action(&self, ctx: &mut ExecutionContext, cancel: &CancellationToken) -> Next {
        loop {
            if ctx.status.is_terminal() {
                return Next::Stop;
            }
            if cancel.is_cancelled() {
                ctx.cancel_execution();
                info!(execution_id = %ctx.execution_id, "Execution cancelled");
                return Next::Stop;
            }

            for step_id in ctx.propagate_skips() {
                debug!(execution_id = %ctx.execution_id, step_id = %step_id, "Step skipped");
                self.publish_step(ctx, &step_id, json!({ "status": "skipped" }));
            }

            let awaiting = ctx.waiting_steps(WaitReason::Approval);
            if !awaiting.is_empty() {
                ctx.suspend(WaitReason::Approval);
                info!(
                    execution_id = %ctx.execution_id,
                    steps = ?awaiting,
                    "Execution waiting for approval"
                );
                return Next::Stop;
            }

            let ready = ctx.get_ready_steps();
            if ready.is_empty() {
                return self.idle(ctx);
            }

            let condition_ctx = ctx.condition_context();
            let mut batch = Vec::new();
            for step_id in ready {
                if batch.len() >= self.max_concurrent_steps {
                    break;
                }
                let Some(step) = ctx.step(&step_id).cloned() else {
                    continue;
                };
                if let Some(expr) = &step.conditions {
                    if !evaluate_condition(expr, &condition_ctx) {
                        ctx.skip_step(&step_id, &format!("condition not met: {}", expr));
                        self.publish_step(ctx, &step_id, json!({ "status": "skipped" }));
                        continue;
                    }
                }
                batch.push(self.prepare_dispatch(ctx, step));
            }
            if !batch.is_empty() {
                return Next::Dispatch(batch);
            }
            // Every ready step was skipped by its condition; re-evaluate.
        }
    }

    fn prepare_dispatch(&self, ctx: &mut ExecutionContext, step: StepConfig) -> Dispatch {
        let step_id = step.step_id.clone();
        let attempt = ctx.step_result(&step_id).map(|r| r.attempts).unwrap_or(0);
        ctx.mark_running(&step_id);
        let input = ctx.get_step_input_data(&step_id);
        let step_ctx = StepContext {
            execution_id: ctx.execution_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            step_id: step_id.clone(),
            prior_output: ctx.prior_output(&step_id),
            attempt,
        };
        debug!(
            execution_id = %ctx.execution_id,
            step_id = %step_id,
            kind = %step.kind,
            "Dispatching step"
        );
        self.publish_step(ctx, &step_id, json!({ "status": "running", "kind": step.kind.as_str() }));
        Dispatch {
            step,
            input,
            ctx: step_ctx,
        }
    }

    /// Nothing is ready: finish, suspend, sleep, or declare the run stuck.
    fn idle(&self, ctx: &mut ExecutionContext) -> Next {
        if ctx.all_steps_settled() {
            ctx.complete_execution();
            info!(execution_id = %ctx.execution_id, "Execution completed");
            return Next::Stop;
        }
        if !ctx.waiting_steps(WaitReason::Poll).is_empty() {
            if self.poll_interval.is_zero() {
                ctx.suspend(WaitReason::Poll);
                info!(execution_id = %ctx.execution_id, "Execution waiting for poll");
                return Next::Stop;
            }
            return Next::Sleep;
        }
        if !ctx.starved_input_steps().is_empty() {
            ctx.suspend(WaitReason::Input);
            info!(execution_id = %ctx.execution_id, "Execution waiting for input");
            return Next::Stop;
        }

        let mut stuck: Vec<String> = ctx.pending_steps().into_iter().collect();
        stuck.sort();
        let message = format!("Workflow stuck: steps {:?} can never become ready", stuck);
        error!(execution_id = %ctx.execution_id, "{}", message);
        ctx.fail_execution(&message);
        Next::Stop
    }

    async fn run_step(&self, dispatch: Dispatch) -> Finished {
        let Dispatch { step, input, ctx } = dispatch;
        let config = self.retry_config_for(&step);
        let component = step.component_key();
        let scope = ErrorScope::new(component.clone(), "execute")
            .with_step(ctx.execution_id.to_string(), step.step_id.clone());

        let mut attempts = 0u32;
        let result = self
            .errors
            .execute_with_retry(
                || {
                    let mut step_ctx = ctx.clone();
                    step_ctx.attempt += attempts;
                    attempts += 1;
                    self.registry.execute(step.clone(), input.clone(), step_ctx)
                },
                &config,
                &scope,
            )
            .await;

        Finished {
            step_id: step.step_id,
            critical: step.critical,
            component,
            result,
            attempts,
        }
    }

    /// Record every result of a batch, then fail the run on a critical failure.
    fn apply(&self, ctx: &mut ExecutionContext, finished: &[Finished]) {
        let mut critical_failure: Option<(String, String)> = None;

        for f in finished {
            let failure = match &f.result {
                Ok(outcome) => match outcome.status {
                    OutcomeStatus::Completed => {
                        ctx.mark_completed(
                            &f.step_id,
                            outcome.output_data.clone(),
                            outcome.rollback_data.clone(),
                            f.attempts,
                        );
                        info!(
                            execution_id = %ctx.execution_id,
                            step_id = %f.step_id,
                            attempts = f.attempts,
                            "Step completed"
                        );
                        self.publish_step(ctx, &f.step_id, json!({ "status": "completed" }));
                        None
                    }
                    OutcomeStatus::InProgress => {
                        ctx.mark_waiting(&f.step_id, WaitReason::Poll, outcome.output_data.clone(), f.attempts);
                        self.publish_step(ctx, &f.step_id, json!({ "status": "waiting", "wait_reason": "poll" }));
                        None
                    }
                    OutcomeStatus::AwaitingApproval => {
                        ctx.mark_waiting(
                            &f.step_id,
                            WaitReason::Approval,
                            outcome.output_data.clone(),
                            f.attempts,
                        );
                        None
                    }
                    OutcomeStatus::Failed => Some(
                        outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "step reported failure".to_string()),
                    ),
                },
                Err(e) => Some(
                    StrataError::StepExecution {
                        component: f.component.clone(),
                        operation: "execute".into(),
                        step_id: f.step_id.clone(),
                        message: e.to_string(),
                    }
                    .to_string(),
                ),
            };

            if let Some(message) = failure {
                ctx.mark_failed(&f.step_id, &message, f.attempts);
                warn!(
                    execution_id = %ctx.execution_id,
                    step_id = %f.step_id,
                    attempts = f.attempts,
                    critical = f.critical,
                    error = %message,
                    "Step failed"
                );
                self.streams.publish(StreamEvent::new(
                    StreamEventType::Error,
                    ctx.execution_id.to_string(),
                    Some(ctx.workflow_id.clone()),
                    json!({ "step_id": f.step_id, "error": message }),
                ));
                if f.critical && critical_failure.is_none() {
                    critical_failure = Some((f.step_id.clone(), message));
                }
            }
        }

        if let Some((step_id, message)) = critical_failure {
            ctx.propagate_skips();
            ctx.fail_execution(&format!("Step '{}' failed: {}", step_id, message));
            error!(execution_id = %ctx.execution_id, step_id = %step_id, "Execution failed");
        }
    }

    /// Drop the results of a batch that outlived its execution's cancellation.
    fn discard(&self, ctx: &mut ExecutionContext, finished: &[Finished]) {
        for f in finished {
            warn!(
                execution_id = %ctx.execution_id,
                step_id = %f.step_id,
                succeeded = f.result.as_ref().map(|o| o.success).unwrap_or(false),
                "Ignoring step result after cancellation"
            );
            ctx.skip_step(&f.step_id, "execution cancelled");
            self.publish_step(ctx, &f.step_id, json!({ "status": "skipped" }));
        }
    }

    async fn persist(&self, ctx: &ExecutionContext, finished: &[Finished]) {
        let Some(store) = &self.store else {
            return;
        };
        for f in finished {
            if let Some(result) = ctx.step_result(&f.step_id) {
                if let Err(e) = store
                    .save_step_result(ctx.execution_id.to_string(), result.clone())
                    .await
                {
                    warn!(execution_id = %ctx.execution_id, step_id = %f.step_id, error = %e, "Failed to save step result");
                }
            }
        }
        match ctx.to_record() {
            Ok(record) => {
                if let Err(e) = store.save_execution(record).await {
                    warn!(execution_id = %ctx.execution_id, error = %e, "Failed to save execution");
                }
            }
            Err(e) => warn!(execution_id = %ctx.execution_id, error = %e, "Failed to snapshot execution"),
        }
    }

    fn publish_step(&self, ctx: &ExecutionContext, step_id: &str, mut data: Value) {
        data["step_id"] = json!(step_id);
        self.streams.publish(StreamEvent::new(
            StreamEventType::Step,
            ctx.execution_id.to_string(),
            Some(ctx.workflow_id.clone()),
            data,
        ));
    }

    fn publish_status(&self, ctx: &ExecutionContext) {
        let summary = ctx.summary();
        let data = serde_json::to_value(&summary).unwrap_or(Value::Null);
        let execution_id = ctx.execution_id.to_string();
        let event_type = if ctx.status.is_terminal() {
            StreamEventType::Complete
        } else {
            StreamEventType::Status
        };
        self.streams.publish(StreamEvent::new(
            event_type,
            execution_id.clone(),
            Some(ctx.workflow_id.clone()),
            data,
        ));
        if ctx.status.is_terminal() {
            self.streams.close_execution(&execution_id);
        }
    }
}
