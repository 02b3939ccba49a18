use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use strata_core::config::RetryConfig;
use strata_core::error::{ErrorKind, Result, StrataError};

use crate::breaker::{BreakerSnapshot, CircuitBreakerRegistry};

/// How bad an error is, for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::CircuitOpen => Self::High,
            ErrorKind::Database | ErrorKind::Io => Self::Critical,
            ErrorKind::Retryable | ErrorKind::Cancelled => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Who is calling, for breaker keys and error records.
#[derive(Debug, Clone, Default)]
pub struct ErrorScope {
    pub component: String,
    pub operation: String,
    pub execution_id: Option<String>,
    pub step_id: Option<String>,
}

impl ErrorScope {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            execution_id: None,
            step_id: None,
        }
    }

    pub fn with_step(mut self, execution_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self.step_id = Some(step_id.into());
        self
    }
}

/// One entry in the bounded error history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub component: String,
    pub operation: String,
    pub execution_id: Option<String>,
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub attempt: u32,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over the error history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub recent_errors: usize,
    pub by_kind: HashMap<ErrorKind, usize>,
    pub by_severity: HashMap<Severity, usize>,
    pub by_component: HashMap<String, usize>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
}

/// Retry + circuit-breaker wrapper around any fallible async operation.
pub struct ErrorHandler {
    breakers: Arc<CircuitBreakerRegistry>,
    history: Mutex<VecDeque<ErrorRecord>>,
    history_limit: usize,
}

impl ErrorHandler {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, history_limit: usize) -> Self {
        Self {
            breakers,
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run `op` under `config`, consulting the breaker for `scope.component`
    /// before every attempt.
    ///
    /// Returns the first success, or the error that ended the loop: an open
    /// breaker, a non-retryable error, or the last error once attempts are
    /// exhausted. Synchronous work can be passed as
    /// `|| std::future::ready(f())`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut op: F,
        config: &RetryConfig,
        scope: &ErrorScope,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            self.breakers.check(&scope.component)?;

            match op().await {
                Ok(value) => {
                    self.breakers.record_success(&scope.component);
                    if attempt > 0 {
                        debug!(
                            component = %scope.component,
                            operation = %scope.operation,
                            attempts = attempt + 1,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = config.should_retry(e.kind());
                    self.record_error(scope, &e, attempt, retryable);
                    self.breakers.record_failure(&scope.component);

                    if !retryable || attempt + 1 >= max_attempts {
                        return Err(e);
                    }

                    let backoff = config.delay_for(attempt);
                    warn!(
                        component = %scope.component,
                        operation = %scope.operation,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, scope: &ErrorScope, error: &StrataError, attempt: u32, retryable: bool) {
        let kind = error.kind();
        let record = ErrorRecord {
            component: scope.component.clone(),
            operation: scope.operation.clone(),
            execution_id: scope.execution_id.clone(),
            step_id: scope.step_id.clone(),
            kind,
            severity: Severity::for_kind(kind),
            message: error.to_string(),
            attempt,
            retryable,
            timestamp: Utc::now(),
        };
        let mut history = self.lock_history();
        history.push_back(record);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// Most recent errors first, optionally for one component.
    pub fn error_history(&self, component: Option<&str>, limit: usize) -> Vec<ErrorRecord> {
        self.lock_history()
            .iter()
            .rev()
            .filter(|r| component.map_or(true, |c| r.component == c))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn error_statistics(&self, component: Option<&str>) -> ErrorStatistics {
        let history = self.lock_history();
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        let mut stats = ErrorStatistics {
            total_errors: 0,
            recent_errors: 0,
            by_kind: HashMap::new(),
            by_severity: HashMap::new(),
            by_component: HashMap::new(),
            circuit_breakers: self.breakers.snapshot(),
        };
        for record in history
            .iter()
            .filter(|r| component.map_or(true, |c| r.component == c))
        {
            stats.total_errors += 1;
            if record.timestamp >= cutoff {
                stats.recent_errors += 1;
            }
            *stats.by_kind.entry(record.kind).or_default() += 1;
            *stats.by_severity.entry(record.severity).or_default() += 1;
            *stats.by_component.entry(record.component.clone()).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use strata_core::config::RetryStrategy;

    fn handler(threshold: u32) -> ErrorHandler {
        ErrorHandler::new(
            Arc::new(CircuitBreakerRegistry::new(threshold, Duration::from_secs(60))),
            100,
        )
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            strategy: RetryStrategy::FixedDelay,
            base_delay_secs: 0.01,
            max_delay_secs: 0.01,
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let h = handler(10);
        let calls = AtomicU32::new(0);
        let result = h
            .execute_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(StrataError::Connection("refused".into()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &fast_retry(5),
                &ErrorScope::new("svc", "call"),
            )
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.breakers().failure_count("svc"), 0);
        assert_eq!(h.error_history(Some("svc"), 10).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_half_open_call_does_not_wedge_breaker() {
        use crate::breaker::BreakerState;

        let h = ErrorHandler::new(
            Arc::new(CircuitBreakerRegistry::new(1, Duration::from_secs(10))),
            100,
        );
        let scope = ErrorScope::new("svc", "call");
        h.breakers().record_failure("svc");
        tokio::time::advance(Duration::from_secs(11)).await;

        let dropped = tokio::time::timeout(
            Duration::from_secs(1),
            h.execute_with_retry(std::future::pending::<Result<()>>, &fast_retry(1), &scope),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(h.breakers().state("svc"), BreakerState::HalfOpen);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let value = h
            .execute_with_retry(|| std::future::ready(Ok(7)), &fast_retry(1), &scope)
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(h.breakers().state("svc"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let h = handler(10);
        let calls = AtomicU32::new(0);
        let err = h
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err::<(), _>(StrataError::Validation("bad input".into())))
                },
                &fast_retry(5),
                &ErrorScope::new("svc", "call"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = h.error_history(None, 10);
        assert!(!history[0].retryable);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let h = handler(10);
        let calls = AtomicU32::new(0);
        let err = h
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err::<(), _>(StrataError::Retryable("busy".into())))
                },
                &fast_retry(3),
                &ErrorScope::new("svc", "call"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Retryable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deny_list_overrides_defaults() {
        let h = handler(10);
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            non_retryable: vec![ErrorKind::Timeout],
            ..fast_retry(4)
        };
        let _ = h
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Err::<(), _>(StrataError::Timeout {
                        operation: "poll".into(),
                        timeout_secs: 1,
                    }))
                },
                &config,
                &ErrorScope::new("svc", "call"),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_five_failures_and_recovers() {
        let h = ErrorHandler::new(
            Arc::new(CircuitBreakerRegistry::new(5, Duration::from_secs(60))),
            100,
        );
        let scope = ErrorScope::new("X", "call");
        let calls = AtomicU32::new(0);
        let once = RetryConfig::no_retry();

        for _ in 0..5 {
            let r = h
                .execute_with_retry(
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::future::ready(Err::<(), _>(StrataError::Connection("down".into())))
                    },
                    &once,
                    &scope,
                )
                .await;
            assert!(matches!(r, Err(StrataError::Connection(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // 6th call is rejected without invoking the operation
        let r = h
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Ok::<_, StrataError>(()))
                },
                &once,
                &scope,
            )
            .await;
        assert!(matches!(r, Err(StrataError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(60)).await;

        let r = h
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Ok::<_, StrataError>(()))
                },
                &once,
                &scope,
            )
            .await;
        assert!(r.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(h.breakers().failure_count("X"), 0);
        assert_eq!(
            h.breakers().state("X"),
            crate::breaker::BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn statistics_and_bounded_history() {
        let h = ErrorHandler::new(Arc::new(CircuitBreakerRegistry::new(100, Duration::from_secs(60))), 3);
        for i in 0..5 {
            let component = if i % 2 == 0 { "a" } else { "b" };
            let _ = h
                .execute_with_retry(
                    || std::future::ready(Err::<(), _>(StrataError::NonRetryable(format!("e{i}")))),
                    &RetryConfig::no_retry(),
                    &ErrorScope::new(component, "op"),
                )
                .await;
        }
        let stats = h.error_statistics(None);
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.recent_errors, 3);
        assert_eq!(stats.by_kind[&ErrorKind::NonRetryable], 3);
        assert_eq!(stats.by_severity[&Severity::Medium], 3);
        assert_eq!(h.error_history(None, 1)[0].message, "Non-retryable error: e4");
        assert_eq!(h.error_statistics(Some("a")).total_errors, 2);
    }
}
