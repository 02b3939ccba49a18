use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use strata_core::error::{Result, StrataError};
use strata_core::traits::{AgentInvoker, StepExecutor, ToolInvoker};
use strata_core::types::{StepContext, StepOutcome};
use strata_core::workflow::StepConfig;

fn required_param(step: &StepConfig, key: &str) -> Result<String> {
    step.param_str(key).map(String::from).ok_or_else(|| {
        StrataError::Validation(format!(
            "step '{}' is missing parameter '{}'",
            step.step_id, key
        ))
    })
}

/// Merge static `parameters.arguments` under the resolved input.
fn call_input(step: &StepConfig, input: Map<String, Value>) -> Value {
    let mut args = step
        .parameters
        .get("arguments")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    args.extend(input);
    Value::Object(args)
}

/// `tool_call` steps: run `parameters.tool` through the host tool runtime.
pub struct ToolCallStep {
    invoker: Arc<dyn ToolInvoker>,
}

impl ToolCallStep {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

impl StepExecutor for ToolCallStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let tool = required_param(&step, "tool")?;
            let result = self.invoker.invoke(tool.clone(), call_input(&step, input)).await?;
            Ok(StepOutcome::completed(json!({ "tool": tool, "result": result })))
        })
    }
}

/// `agent_call` steps: hand the input to `parameters.agent`.
pub struct AgentCallStep {
    invoker: Arc<dyn AgentInvoker>,
}

impl AgentCallStep {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }
}

impl StepExecutor for AgentCallStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let agent = required_param(&step, "agent")?;
            let mut payload = call_input(&step, input);
            if let Some(prompt) = step.param_str("prompt") {
                payload["prompt"] = json!(prompt);
            }
            let response = self.invoker.invoke(agent.clone(), payload).await?;
            Ok(StepOutcome::completed(json!({ "agent": agent, "response": response })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::ExecutionId;
    use strata_core::workflow::StepKind;

    struct Echo;

    impl ToolInvoker for Echo {
        fn invoke(&self, tool: String, input: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Ok(json!({ "echo": tool, "input": input })) })
        }
    }

    impl AgentInvoker for Echo {
        fn invoke(&self, agent: String, input: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Ok(json!({ "agent": agent, "saw": input })) })
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            execution_id: ExecutionId::new(),
            workflow_id: "wf".into(),
            step_id: "s".into(),
            prior_output: None,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn tool_call_merges_arguments_and_input() {
        let step = StepConfig::new("s", StepKind::ToolCall)
            .with_parameter("tool", json!("lookup"))
            .with_parameter("arguments", json!({"limit": 5, "q": "static"}));
        let mut input = Map::new();
        input.insert("q".into(), json!("dynamic"));

        let out = ToolCallStep::new(Arc::new(Echo))
            .execute(step, input, ctx())
            .await
            .unwrap();
        assert_eq!(out.output_data["tool"], json!("lookup"));
        assert_eq!(out.output_data["result"]["input"], json!({"limit": 5, "q": "dynamic"}));
    }

    #[tokio::test]
    async fn missing_tool_parameter_is_validation_error() {
        let err = ToolCallStep::new(Arc::new(Echo))
            .execute(StepConfig::new("s", StepKind::ToolCall), Map::new(), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[tokio::test]
    async fn agent_call_passes_prompt() {
        let step = StepConfig::new("s", StepKind::AgentCall)
            .with_parameter("agent", json!("summarizer"))
            .with_parameter("prompt", json!("Summarize"));
        let out = AgentCallStep::new(Arc::new(Echo))
            .execute(step, Map::new(), ctx())
            .await
            .unwrap();
        assert_eq!(out.output_data["response"]["saw"]["prompt"], json!("Summarize"));
    }
}
