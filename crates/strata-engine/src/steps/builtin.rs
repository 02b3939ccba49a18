//! Built-in data steps: trigger/input sources, transform, merge, delay.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use strata_core::error::{Result, StrataError};
use strata_core::traits::StepExecutor;
use strata_core::types::{StepContext, StepOutcome};
use strata_core::workflow::StepConfig;

/// Trigger and input steps: emit the payload supplied for them.
pub struct SourceStep;

impl StepExecutor for SourceStep {
    fn execute(
        &self,
        _step: StepConfig,
        input: Map<String, Value>,
        ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let output = match ctx.prior_output {
                Some(data) => data,
                None => Value::Object(input),
            };
            Ok(StepOutcome::completed(output))
        })
    }
}

fn map_strings(input: Map<String, Value>, f: impl Fn(&str) -> String) -> Value {
    Value::Object(
        input
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, Value::String(f(&s))),
                other => (k, other),
            })
            .collect(),
    )
}

fn text_of(input: &Map<String, Value>) -> &str {
    ["text", "content", "data"]
        .iter()
        .find_map(|k| input.get(*k).and_then(|v| v.as_str()))
        .unwrap_or("")
}

/// Reshape the resolved input according to `parameters.operation`.
pub struct TransformStep;

impl TransformStep {
    pub fn apply(operation: &str, step: &StepConfig, input: Map<String, Value>) -> Result<Value> {
        match operation {
            "passthrough" => Ok(Value::Object(input)),
            "uppercase" => Ok(map_strings(input, |s| s.to_uppercase())),
            "lowercase" => Ok(map_strings(input, |s| s.to_lowercase())),
            "word_count" => {
                let text = text_of(&input);
                Ok(json!({
                    "word_count": text.split_whitespace().count(),
                    "character_count": text.chars().count(),
                }))
            }
            "pick" => {
                let fields: Vec<&str> = step
                    .parameters
                    .get("fields")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|f| f.as_str()).collect())
                    .unwrap_or_default();
                Ok(Value::Object(
                    input
                        .into_iter()
                        .filter(|(k, _)| fields.contains(&k.as_str()))
                        .collect(),
                ))
            }
            other => Err(StrataError::Validation(format!(
                "step '{}': unknown transform operation '{}'",
                step.step_id, other
            ))),
        }
    }
}

impl StepExecutor for TransformStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let operation = step.param_str("operation").unwrap_or("passthrough").to_string();
            let result = Self::apply(&operation, &step, input)?;
            Ok(StepOutcome::completed(json!({
                "result": result,
                "operation": operation,
            })))
        })
    }
}

/// Combine the resolved input according to `parameters.strategy`.
pub struct MergeStep;

impl MergeStep {
    pub fn apply(strategy: &str, step: &StepConfig, input: Map<String, Value>) -> Result<Value> {
        let keys: Option<Vec<String>> = step
            .parameters
            .get("keys")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|k| k.as_str().map(String::from)).collect());
        let selected: Map<String, Value> = match &keys {
            Some(keys) => input.into_iter().filter(|(k, _)| keys.contains(k)).collect(),
            None => input,
        };

        match strategy {
            "combine" => {
                let keys: Vec<&String> = selected.keys().collect();
                Ok(json!({ "keys_merged": keys, "merged": selected }))
            }
            "concatenate" => {
                let text = selected
                    .values()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(json!({ "text": text }))
            }
            "sum" => {
                let numbers: Vec<f64> = selected.values().filter_map(|v| v.as_f64()).collect();
                Ok(json!({ "sum": numbers.iter().sum::<f64>(), "count": numbers.len() }))
            }
            other => Err(StrataError::Validation(format!(
                "step '{}': unknown merge strategy '{}'",
                step.step_id, other
            ))),
        }
    }
}

impl StepExecutor for MergeStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let strategy = step.param_str("strategy").unwrap_or("combine").to_string();
            let mut output = Self::apply(&strategy, &step, input)?;
            output["strategy"] = json!(strategy);
            Ok(StepOutcome::completed(output))
        })
    }
}

/// Sleep for `parameters.delay_ms`, then pass the input through.
pub struct DelayStep;

impl StepExecutor for DelayStep {
    fn execute(
        &self,
        step: StepConfig,
        input: Map<String, Value>,
        _ctx: StepContext,
    ) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(async move {
            let delay_ms = step
                .parameters
                .get("delay_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(StepOutcome::completed(json!({
                "delayed_ms": delay_ms,
                "input": input,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::{ExecutionId, OutcomeStatus};
    use strata_core::workflow::StepKind;

    fn ctx(prior: Option<Value>) -> StepContext {
        StepContext {
            execution_id: ExecutionId::new(),
            workflow_id: "wf".into(),
            step_id: "s".into(),
            prior_output: prior,
            attempt: 0,
        }
    }

    fn input(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn source_emits_prior_output() {
        let out = SourceStep
            .execute(
                StepConfig::new("trigger", StepKind::Trigger),
                Map::new(),
                ctx(Some(json!({"user": "ada"}))),
            )
            .await
            .unwrap();
        assert_eq!(out.status, OutcomeStatus::Completed);
        assert_eq!(out.output_data, json!({"user": "ada"}));
    }

    #[tokio::test]
    async fn transform_operations() {
        let step = StepConfig::new("t", StepKind::Transform).with_parameter("operation", json!("uppercase"));
        let out = TransformStep
            .execute(step, input(json!({"a": "hi", "n": 1})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["result"], json!({"a": "HI", "n": 1}));

        let step = StepConfig::new("t", StepKind::Transform).with_parameter("operation", json!("word_count"));
        let out = TransformStep
            .execute(step, input(json!({"text": "one two  three"})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["result"]["word_count"], json!(3));

        let step = StepConfig::new("t", StepKind::Transform)
            .with_parameter("operation", json!("pick"))
            .with_parameter("fields", json!(["keep"]));
        let out = TransformStep
            .execute(step, input(json!({"keep": 1, "drop": 2})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["result"], json!({"keep": 1}));
    }

    #[tokio::test]
    async fn transform_unknown_operation_is_validation_error() {
        let step = StepConfig::new("t", StepKind::Transform).with_parameter("operation", json!("explode"));
        let err = TransformStep
            .execute(step, Map::new(), ctx(None))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[tokio::test]
    async fn merge_strategies() {
        let step = StepConfig::new("m", StepKind::Merge);
        let out = MergeStep
            .execute(step, input(json!({"a": 1, "b": 2})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["merged"], json!({"a": 1, "b": 2}));
        assert_eq!(out.output_data["strategy"], json!("combine"));

        let step = StepConfig::new("m", StepKind::Merge)
            .with_parameter("strategy", json!("sum"))
            .with_parameter("keys", json!(["a", "c"]));
        let out = MergeStep
            .execute(step, input(json!({"a": 1, "b": 2, "c": 4})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["sum"], json!(5.0));
        assert_eq!(out.output_data["count"], json!(2));

        let step = StepConfig::new("m", StepKind::Merge).with_parameter("strategy", json!("concatenate"));
        let out = MergeStep
            .execute(step, input(json!({"a": "hello", "b": "world"})), ctx(None))
            .await
            .unwrap();
        assert_eq!(out.output_data["text"], json!("hello world"));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_then_passes_through() {
        let step = StepConfig::new("d", StepKind::Delay).with_parameter("delay_ms", json!(250));
        let started = tokio::time::Instant::now();
        let out = DelayStep
            .execute(step, input(json!({"x": 1})), ctx(None))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(out.output_data["input"], json!({"x": 1}));
    }
}
