use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use strata_core::config::BreakerConfig;
use strata_core::error::{Result, StrataError};

/// Breaker position for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// Start of the half-open trial call, while it has not reported back.
    trial_started: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            trial_started: None,
        }
    }
}

/// Point-in-time view of a component's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub component: String,
    pub state: BreakerState,
    pub failure_count: u32,
    /// Milliseconds since the most recent failure.
    pub since_last_failure_ms: Option<u64>,
}

/// Process-wide circuit breakers, one per component key.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.recovery_timeout())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit or reject a call to `component`.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and admits exactly one trial call; everything else is rejected with
    /// [`StrataError::CircuitOpen`] without counting as a failure. A trial
    /// that never reports back within the recovery timeout is abandoned and
    /// the next call takes its place.
    pub fn check(&self, component: &str) -> Result<()> {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    info!(component, "Circuit breaker half-open, admitting trial call");
                    breaker.state = BreakerState::HalfOpen;
                    breaker.trial_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(StrataError::CircuitOpen(component.to_string()))
                }
            }
            BreakerState::HalfOpen => match breaker.trial_started {
                Some(started) if started.elapsed() < self.recovery_timeout => {
                    Err(StrataError::CircuitOpen(component.to_string()))
                }
                abandoned => {
                    if abandoned.is_some() {
                        warn!(component, "Half-open trial call never reported, admitting another");
                    }
                    breaker.trial_started = Some(Instant::now());
                    Ok(())
                }
            },
        }
    }

    pub fn record_success(&self, component: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);
        if breaker.state != BreakerState::Closed {
            info!(component, "Circuit breaker closed");
        }
        breaker.state = BreakerState::Closed;
        breaker.failure_count = 0;
        breaker.trial_started = None;
    }

    pub fn record_failure(&self, component: &str) {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(component.to_string())
            .or_insert_with(Breaker::new);
        breaker.failure_count += 1;
        breaker.last_failure_time = Some(Instant::now());
        breaker.trial_started = None;

        let should_open = match breaker.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => breaker.failure_count >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if should_open {
            warn!(
                component,
                failure_count = breaker.failure_count,
                recovery_secs = self.recovery_timeout.as_secs(),
                "Circuit breaker opened"
            );
            breaker.state = BreakerState::Open;
        }
    }

    pub fn state(&self, component: &str) -> BreakerState {
        self.lock()
            .get(component)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failure_count(&self, component: &str) -> u32 {
        self.lock().get(component).map(|b| b.failure_count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .lock()
            .iter()
            .map(|(component, b)| BreakerSnapshot {
                component: component.clone(),
                state: b.state,
                failure_count: b.failure_count,
                since_last_failure_ms: b.last_failure_time.map(|t| t.elapsed().as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| a.component.cmp(&b.component));
        out
    }

    /// Force a component back to closed.
    pub fn reset(&self, component: &str) {
        self.lock().remove(component);
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::from_config(&BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(10));
        for _ in 0..2 {
            reg.check("svc").unwrap();
            reg.record_failure("svc");
        }
        assert_eq!(reg.state("svc"), BreakerState::Closed);
        reg.record_failure("svc");
        assert_eq!(reg.state("svc"), BreakerState::Open);
        assert!(matches!(reg.check("svc"), Err(StrataError::CircuitOpen(_))));
        // rejection does not count as a failure
        assert_eq!(reg.failure_count("svc"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_trial_call() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(10));
        reg.record_failure("svc");
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(reg.check("svc").is_ok());
        assert_eq!(reg.state("svc"), BreakerState::HalfOpen);
        assert!(reg.check("svc").is_err());

        reg.record_success("svc");
        assert_eq!(reg.state("svc"), BreakerState::Closed);
        assert_eq!(reg.failure_count("svc"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_call_reopens() {
        let reg = CircuitBreakerRegistry::new(2, Duration::from_secs(5));
        reg.record_failure("svc");
        reg.record_failure("svc");
        tokio::time::advance(Duration::from_secs(6)).await;
        reg.check("svc").unwrap();
        reg.record_failure("svc");
        assert_eq!(reg.state("svc"), BreakerState::Open);
        assert!(reg.check("svc").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_trial_call_is_replaced_after_recovery_timeout() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(10));
        reg.record_failure("svc");
        tokio::time::advance(Duration::from_secs(11)).await;
        reg.check("svc").unwrap();

        // The admitted call never records success or failure.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(reg.check("svc"), Err(StrataError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(reg.check("svc").is_ok());
        assert_eq!(reg.state("svc"), BreakerState::HalfOpen);
        assert!(reg.check("svc").is_err());

        reg.record_success("svc");
        assert_eq!(reg.state("svc"), BreakerState::Closed);
    }

    #[test]
    fn components_are_independent() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(60));
        reg.record_failure("a");
        assert_eq!(reg.state("a"), BreakerState::Open);
        assert!(reg.check("b").is_ok());
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].component, "a");
        reg.reset("a");
        assert_eq!(reg.state("a"), BreakerState::Closed);
    }
}
