use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use strata_core::error::Result;
use strata_core::traits::StepExecutor;
use strata_core::types::{ApprovalBackend, ApprovalStatus, StepContext, StepOutcome};
use strata_core::workflow::StepConfig;

use crate::approval::ApprovalBroker;

/// `approval` steps: suspend until a human decides.
///
/// The first invocation opens a request and parks the step. When the step is
/// resumed the decision is already in its prior output and becomes the
/// outcome.
pub struct ApprovalStep {
    broker: Arc<ApprovalBroker>,
    default_backend: ApprovalBackend,
}

impl ApprovalStep {
    pub fn new(broker: Arc<ApprovalBroker>, default_backend: ApprovalBackend) -> Self {
        Self {
            broker,
            default_backend,
        }
    }
}

fn decided(output: &Value) -> Option<StepOutcome> {
    match output.get("approval_status").and_then(|v| v.as_str()) {
        Some("approved") => Some(StepOutcome::completed(output.clone())),
        Some("denied") => {
            let by = output
                .get("decided_by")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let mut message = format!("approval denied by {}", by);
            if let Some(comment) = output.get("comment").and_then(|v| v.as_str()) {
                message.push_str(": ");
                message.push_str(comment);
            }
            Some(StepOutcome::failed(message))
        }
        _ => None,
    }
}

impl StepExecutor for ApprovalStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            if let Some(outcome) = ctx.prior_output.as_ref().and_then(decided) {
                return Ok(outcome);
            }

            let prompt = step
                .param_str("prompt")
                .map(String::from)
                .unwrap_or_else(|| format!("Approve step '{}'?", step.step_id));
            let backend = step
                .param_str("backend")
                .and_then(|b| b.parse().ok())
                .unwrap_or(self.default_backend);

            let request = self
                .broker
                .open(
                    &ctx.workflow_id,
                    ctx.execution_id.as_str(),
                    &ctx.step_id,
                    &prompt,
                    backend,
                    json!({ "input": input }),
                )
                .await?;

            if request.status == ApprovalStatus::Pending {
                return Ok(StepOutcome::awaiting_approval(json!({
                    "approval_request_id": request.id,
                    "status": "pending",
                    "prompt": request.prompt,
                })));
            }
            let output = ApprovalBroker::decision_output(&request);
            Ok(decided(&output).unwrap_or_else(|| StepOutcome::completed(output)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::{ApprovalDecision, ExecutionId, OutcomeStatus};
    use strata_core::workflow::StepKind;

    use crate::stream::StreamManager;

    fn ctx(prior: Option<Value>) -> StepContext {
        StepContext {
            execution_id: ExecutionId::from_string("exec-1"),
            workflow_id: "wf".into(),
            step_id: "review".into(),
            prior_output: prior,
            attempt: 0,
        }
    }

    fn setup() -> (Arc<ApprovalBroker>, ApprovalStep) {
        let broker = Arc::new(ApprovalBroker::new(Arc::new(StreamManager::default())));
        let step = ApprovalStep::new(broker.clone(), ApprovalBackend::Local);
        (broker, step)
    }

    fn review() -> StepConfig {
        StepConfig::new("review", StepKind::Approval).with_parameter("prompt", json!("Publish?"))
    }

    #[tokio::test]
    async fn first_invocation_opens_request() {
        let (broker, step) = setup();
        let out = step.execute(review(), Map::new(), ctx(None)).await.unwrap();
        assert_eq!(out.status, OutcomeStatus::AwaitingApproval);
        assert_eq!(out.output_data["prompt"], json!("Publish?"));

        let pending = broker.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(out.output_data["approval_request_id"], json!(pending[0].id));
    }

    #[tokio::test]
    async fn resumed_with_approval_completes() {
        let (_, step) = setup();
        let prior = json!({"approval_status": "approved", "decided_by": "ops"});
        let out = step.execute(review(), Map::new(), ctx(Some(prior))).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output_data["decided_by"], json!("ops"));
    }

    #[tokio::test]
    async fn denial_fails_with_comment() {
        let (_, step) = setup();
        let prior = json!({"approval_status": "denied", "decided_by": "ops", "comment": "not yet"});
        let out = step.execute(review(), Map::new(), ctx(Some(prior))).await.unwrap();
        assert_eq!(out.status, OutcomeStatus::Failed);
        assert_eq!(out.error.as_deref(), Some("approval denied by ops: not yet"));
    }

    #[tokio::test]
    async fn reinvocation_after_decision_uses_broker_state() {
        let (broker, step) = setup();
        let first = step.execute(review(), Map::new(), ctx(None)).await.unwrap();
        let id = first.output_data["approval_request_id"].as_str().unwrap().to_string();
        broker
            .resolve(&id, ApprovalDecision { decided_by: "ops".into(), ..Default::default() }, true)
            .await
            .unwrap();

        let again = step
            .execute(review(), Map::new(), ctx(Some(first.output_data)))
            .await
            .unwrap();
        assert!(again.success);
        assert_eq!(again.output_data["approval_request_id"], json!(id));
        assert_eq!(broker.pending_requests().await.unwrap().len(), 0);
    }
}
