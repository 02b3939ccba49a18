use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    // Caller mistakes
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Transient failures
    #[error("Retryable error: {0}")]
    Retryable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout after {timeout_secs}s: {operation}")]
    Timeout { operation: String, timeout_secs: u64 },

    // Permanent failures
    #[error("Non-retryable error: {0}")]
    NonRetryable(String),

    #[error("Circuit breaker open for component: {0}")]
    CircuitOpen(String),

    #[error("Step execution failed: {component}/{operation} (step {step_id}): {message}")]
    StepExecution {
        component: String,
        operation: String,
        step_id: String,
        message: String,
    },

    #[error("No executor registered for step type: {0}")]
    ExecutorNotRegistered(String),

    // Executions
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    // Approvals
    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval request already decided: {id} ({status})")]
    ApprovalAlreadyDecided { id: String, status: String },

    // Tenancy
    #[error("Invalid tenant id: {0}")]
    InvalidTenantId(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant already exists: {0}")]
    TenantExists(String),

    #[error("Tenant is inactive: {0}")]
    TenantInactive(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`StrataError`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    Retryable,
    Connection,
    Timeout,
    NonRetryable,
    CircuitOpen,
    StepExecution,
    NotFound,
    Cancelled,
    Approval,
    Tenant,
    Database,
    Io,
    Serialization,
}

impl ErrorKind {
    /// Kinds retried when a policy carries no explicit allow list.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(self, Self::Retryable | Self::Connection | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Retryable => "retryable",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::NonRetryable => "non_retryable",
            Self::CircuitOpen => "circuit_open",
            Self::StepExecution => "step_execution",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::Approval => "approval",
            Self::Tenant => "tenant",
            Self::Database => "database",
            Self::Io => "io",
            Self::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StrataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Configuration(_) | Self::ConfigNotFound(_) | Self::ExecutorNotRegistered(_) => {
                ErrorKind::Configuration
            }
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NonRetryable(_) => ErrorKind::NonRetryable,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::StepExecution { .. } => ErrorKind::StepExecution,
            Self::ExecutionNotFound(_) | Self::ApprovalNotFound(_) => ErrorKind::NotFound,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::ApprovalAlreadyDecided { .. } => ErrorKind::Approval,
            Self::InvalidTenantId(_)
            | Self::TenantNotFound(_)
            | Self::TenantExists(_)
            | Self::TenantInactive(_) => ErrorKind::Tenant,
            Self::Database(_) => ErrorKind::Database,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Serialization,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable_by_default()
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_classification() {
        assert!(StrataError::Connection("refused".into()).is_retryable());
        assert!(StrataError::Retryable("busy".into()).is_retryable());
        assert!(StrataError::Timeout {
            operation: "poll".into(),
            timeout_secs: 5
        }
        .is_retryable());

        assert!(!StrataError::Validation("bad".into()).is_retryable());
        assert!(!StrataError::Configuration("bad".into()).is_retryable());
        assert!(!StrataError::NonRetryable("gone".into()).is_retryable());
        assert!(!StrataError::CircuitOpen("x".into()).is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NonRetryable).unwrap();
        assert_eq!(json, "\"non_retryable\"");
        let kind: ErrorKind = serde_json::from_str("\"circuit_open\"").unwrap();
        assert_eq!(kind, ErrorKind::CircuitOpen);
    }
}
