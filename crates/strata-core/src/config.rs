use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, StrataError};
use crate::types::ApprovalBackend;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
    #[serde(default)]
    pub jobs: Option<JobsConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on steps dispatched together in one scheduling pass.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// Re-poll interval for two-phase steps. 0 suspends the run until polled.
    #[serde(default)]
    pub poll_interval_ms: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub approval_backend: ApprovalBackend,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            poll_interval_ms: 0,
            history_limit: default_history_limit(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            approval_backend: ApprovalBackend::Local,
        }
    }
}

fn default_max_concurrent_steps() -> usize {
    16
}
fn default_history_limit() -> usize {
    1000
}
fn default_heartbeat_interval() -> u64 {
    15
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    FixedDelay,
    LinearBackoff,
    ExponentialBackoff,
}

/// Retry policy attached to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// When non-empty, only these kinds are retried.
    #[serde(default)]
    pub retryable: Vec<ErrorKind>,
    /// Never retried, checked before anything else.
    #[serde(default)]
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: default_strategy(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable: Vec::new(),
            non_retryable: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_strategy() -> RetryStrategy {
    RetryStrategy::ExponentialBackoff
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            strategy: RetryStrategy::None,
            ..Self::default()
        }
    }

    /// Whether an error of this kind may be retried under this policy.
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        if self.non_retryable.contains(&kind) {
            return false;
        }
        if !self.retryable.is_empty() {
            return self.retryable.contains(&kind);
        }
        kind.is_retryable_by_default()
    }

    /// Un-jittered delay in seconds before the retry following `attempt` (0-based).
    pub fn base_delay_for(&self, attempt: u32) -> f64 {
        let raw = match self.strategy {
            RetryStrategy::None => 0.0,
            RetryStrategy::FixedDelay => self.base_delay_secs,
            RetryStrategy::LinearBackoff => self.base_delay_secs * (attempt as f64 + 1.0),
            RetryStrategy::ExponentialBackoff => {
                self.base_delay_secs * self.backoff_multiplier.powi(attempt as i32)
            }
        };
        raw.min(self.max_delay_secs).max(0.0)
    }

    /// Delay before the retry following `attempt`, with ±10% jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut secs = self.base_delay_for(attempt);
        if self.jitter && secs > 0.0 {
            let factor = 0.9 + rand::random::<f64>() * 0.2;
            secs *= factor;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_error_history_limit")]
    pub error_history_limit: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            error_history_limit: default_error_history_limit(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    60
}
fn default_error_history_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_tenant_id_pattern")]
    pub tenant_id_pattern: String,
    #[serde(default)]
    pub default_tenant: Option<String>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            schema_prefix: default_schema_prefix(),
            case_sensitive: false,
            tenant_id_pattern: default_tenant_id_pattern(),
            default_tenant: None,
            cache_ttl_secs: default_cache_ttl(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

impl TenancyConfig {
    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_data_dir() -> String {
    "~/.strata/data".to_string()
}
fn default_schema_prefix() -> String {
    "tenant_".to_string()
}
fn default_tenant_id_pattern() -> String {
    "^[a-z][a-z0-9_]*$".to_string()
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_max_idle_connections() -> usize {
    8
}

/// External job service used by two-phase steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub base_url: String,
    #[serde(default = "default_jobs_timeout")]
    pub timeout_secs: u64,
}

fn default_jobs_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "strata=info,warn".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StrataError::Configuration(e.to_string()))
    }

    /// Load if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn log_filter(&self) -> String {
        self.log
            .as_ref()
            .map(|l| l.level.clone())
            .unwrap_or_else(default_log_level)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
