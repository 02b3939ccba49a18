use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RetryStrategy;
use crate::error::{Result, StrataError};

/// Placeholder in an input mapping that names the step's single dependency.
pub const PREV_PLACEHOLDER: &str = "$prev";

/// Legacy key in `step_io_data` that satisfies every trigger/input step.
pub const TRIGGER_RAW_KEY: &str = "trigger_raw";

/// The closed set of step types the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trigger,
    Input,
    Merge,
    Transform,
    Delay,
    ToolCall,
    AgentCall,
    ExternalJob,
    Approval,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Input => "input",
            Self::Merge => "merge",
            Self::Transform => "transform",
            Self::Delay => "delay",
            Self::ToolCall => "tool_call",
            Self::AgentCall => "agent_call",
            Self::ExternalJob => "external_job",
            Self::Approval => "approval",
        }
    }

    /// Trigger and input steps become ready when data is supplied for them.
    pub fn is_data_source(&self) -> bool {
        matches!(self, Self::Trigger | Self::Input)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness rule for merge steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Ready once any dependency has completed.
    FirstAvailable,
    /// Ready once every dependency has completed.
    #[default]
    WaitAll,
}

/// Declarative description of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique id. Assigned during normalization when left empty.
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "step_type")]
    pub kind: StepKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// `param -> source_ref`; top-level mapping wins over `parameters.input_mapping`.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Expression evaluated just before dispatch; false skips the step.
    #[serde(default)]
    pub conditions: Option<String>,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub retry_delay_seconds: Option<f64>,
    #[serde(default)]
    pub max_retry_delay_seconds: Option<f64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Circuit-breaker key; defaults to `step:<step_type>`.
    #[serde(default)]
    pub component: Option<String>,
}

fn default_critical() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}

impl StepConfig {
    pub fn new(step_id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_id: step_id.into(),
            name: None,
            kind,
            dependencies: Vec::new(),
            input_mapping: HashMap::new(),
            parameters: serde_json::Map::new(),
            conditions: None,
            critical: default_critical(),
            max_retries: default_max_retries(),
            retry_strategy: None,
            retry_delay_seconds: None,
            max_retry_delay_seconds: None,
            timeout_seconds: None,
            component: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mapping(mut self, param: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping.insert(param.into(), source.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.conditions = Some(expr.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Circuit-breaker component key.
    pub fn component_key(&self) -> String {
        self.component
            .clone()
            .unwrap_or_else(|| format!("step:{}", self.kind))
    }

    /// Merge readiness mode from `parameters.mode`. Defaults to wait-all.
    pub fn merge_mode(&self) -> Result<MergeMode> {
        match self.parameters.get("mode") {
            None | Some(serde_json::Value::Null) => Ok(MergeMode::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                StrataError::Validation(format!(
                    "step '{}': invalid merge mode {}",
                    self.step_id, value
                ))
            }),
        }
    }

    /// The mapping that governs input resolution.
    ///
    /// A non-empty top-level `input_mapping` wins; otherwise string entries
    /// nested under `parameters.input_mapping` are used.
    pub fn effective_input_mapping(&self) -> HashMap<String, String> {
        if !self.input_mapping.is_empty() {
            return self.input_mapping.clone();
        }
        self.parameters
            .get("input_mapping")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// A declarative workflow: a graph of steps plus global variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub global_variables: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: None,
            description: None,
            version: None,
            steps,
            global_variables: serde_json::Map::new(),
        }
    }

    pub fn with_global(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.global_variables.insert(key.into(), value);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StrataError::Validation(e.to_string()))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| StrataError::Validation(e.to_string()))
    }

    /// Load from disk; `.toml` files are parsed as TOML, everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = Vec::new();
        for step in &self.steps {
            if !kinds.contains(&step.kind) {
                kinds.push(step.kind);
            }
        }
        kinds
    }
}
