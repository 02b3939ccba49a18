use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Lifecycle of a whole workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(ExecutionStatus {
    Pending => "pending",
    Running => "running",
    Waiting => "waiting",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

string_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Waiting => "waiting",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// Why a run (or a step) is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// A two-phase step must be polled again.
    Poll,
    /// A human decision is outstanding.
    Approval,
    /// An input step has no data yet.
    Input,
}

string_enum!(WaitReason {
    Poll => "poll",
    Approval => "approval",
    Input => "input",
});

/// Recorded result of the latest attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_data: Option<serde_json::Value>,
    #[serde(default)]
    pub wait_reason: Option<WaitReason>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output_data: None,
            error: None,
            rollback_data: None,
            wait_reason: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
        }
    }
}

/// Status reported by a step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    /// External work is still running; invoke the step again later.
    InProgress,
    /// The step is parked on an approval request.
    AwaitingApproval,
}

/// What a step executor returns for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub output_data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_data: Option<serde_json::Value>,
}

impl StepOutcome {
    pub fn completed(output_data: serde_json::Value) -> Self {
        Self {
            success: true,
            status: OutcomeStatus::Completed,
            output_data,
            error: None,
            rollback_data: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Failed,
            output_data: serde_json::Value::Null,
            error: Some(error.into()),
            rollback_data: None,
        }
    }

    pub fn in_progress(output_data: serde_json::Value) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::InProgress,
            output_data,
            error: None,
            rollback_data: None,
        }
    }

    pub fn awaiting_approval(output_data: serde_json::Value) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::AwaitingApproval,
            output_data,
            error: None,
            rollback_data: None,
        }
    }

    pub fn with_rollback(mut self, rollback_data: serde_json::Value) -> Self {
        self.rollback_data = Some(rollback_data);
        self
    }
}

/// Read-only view of the run handed to a step executor.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub step_id: String,
    /// Output recorded for this step by an earlier invocation, if any.
    pub prior_output: Option<serde_json::Value>,
    pub attempt: u32,
}

/// Approval request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

string_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
});

/// Where a decided approval gets resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalBackend {
    /// The engine resumes the run in-process.
    #[default]
    Local,
    /// A durable orchestrator outside the engine resumes the run.
    External,
}

string_enum!(ApprovalBackend {
    Local => "local",
    External => "external",
});

/// A persisted request gating a step on a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub status: ApprovalStatus,
    pub prompt: String,
    pub backend: ApprovalBackend,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub response_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub comment: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

/// Out-of-band decision submitted for an approval request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decided_by: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Inactive,
}

string_enum!(TenantStatus {
    Active => "active",
    Inactive => "inactive",
});

/// Registry row for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TenantStatus,
    pub schema_name: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub is_schema_initialized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress event kinds delivered to stream subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Status,
    Step,
    Error,
    Heartbeat,
    Complete,
}

/// One frame on an execution or workflow channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub execution_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StreamEvent {
    pub fn new(
        event_type: StreamEventType,
        execution_id: impl Into<String>,
        workflow_id: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            execution_id: execution_id.into(),
            workflow_id,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Render as a server-sent-events frame.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

/// Persisted row for one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Full serialized execution context.
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact, query-only view of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub wait_reason: Option<WaitReason>,
    pub total_steps: usize,
    pub step_counts: HashMap<StepStatus, usize>,
    pub progress: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl ExecutionSummary {
    pub fn count(&self, status: StepStatus) -> usize {
        self.step_counts.get(&status).copied().unwrap_or(0)
    }
}

/// Request to start an external job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Topic the job service publishes completion on.
    pub callback_topic: String,
}

/// Handle returned when an external job is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    #[serde(default)]
    pub callback_token: Option<String>,
}

/// State of an external job as reported by the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: JobState,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Waiting,
            ExecutionStatus::Cancelled,
        ] {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn sse_frame_format() {
        let event = StreamEvent::new(
            StreamEventType::Heartbeat,
            "exec-1",
            None,
            serde_json::json!({}),
        );
        let frame = event.to_sse();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"heartbeat\""));
    }

    #[test]
    fn outcome_constructors() {
        let ok = StepOutcome::completed(serde_json::json!({"a": 1}));
        assert!(ok.success);
        assert_eq!(ok.status, OutcomeStatus::Completed);

        let waiting = StepOutcome::in_progress(serde_json::json!({"job_id": "j"}));
        assert!(!waiting.success);
        assert_eq!(waiting.status, OutcomeStatus::InProgress);

        let failed = StepOutcome::failed("boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
