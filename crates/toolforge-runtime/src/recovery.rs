//! Failure recovery: retries, circuit breaking and fallback chains.
//!
//! [`RecoveryPolicy::attempt_recovery`] retries a failed call with
//! exponential backoff while the failures stay recoverable.  Every call
//! outcome feeds a per-module circuit breaker:
//!
//! - **Closed**: calls flow through; consecutive failures are counted.
//! - **Open**: the failure threshold was reached; calls fail fast with
//!   `CIRCUIT_OPEN` until the cool-down elapses.
//! - **HalfOpen**: one trial call is let through; success closes the
//!   circuit, failure reopens it.
//!
//! Fallback chains are ordered lists of alternate module ids registered per
//! primary.  The runtime facade walks them once the primary's retries are
//! spent or its circuit is open.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ModuleError, Result};
use crate::events::{EventBus, RuntimeEvent};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry, backoff and circuit breaker settings.
///
/// Durations are written in milliseconds in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Total invocations per call, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound on the delay between retries.
    #[serde(with = "duration_ms", rename = "max_retry_delay_ms")]
    pub max_retry_delay: Duration,
    /// Consecutive failures that open a module's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    #[serde(with = "duration_ms", rename = "cool_down_ms")]
    pub cool_down: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(1),
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let secs = (self.retry_delay.as_secs_f64() * factor.powi(exp))
            .min(self.max_retry_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Circuit breaker state of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// When the current half-open trial was let through.
    trial_started: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

/// Where a call is in the recovery state machine.  Used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting,
    Succeeded,
    Classifying,
    RetryScheduled,
    CircuitOpen,
    FallbackInvoked,
    Failed,
}

/// Outcome of [`RecoveryPolicy::attempt_recovery`].
#[derive(Debug)]
pub struct RecoveryAttempt<T> {
    /// `false` when the original error was not recoverable.
    pub attempted: bool,
    pub success: bool,
    /// Retries actually invoked (the original call is not counted).
    pub attempts: u32,
    /// Codes of the failures that led to a retry, oldest first.
    pub retried: Vec<ErrorCode>,
    pub result: Result<T>,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Per-runtime recovery state.
pub struct RecoveryPolicy {
    config: RecoveryConfig,
    circuits: DashMap<String, Circuit>,
    fallbacks: DashMap<String, Vec<String>>,
    events: EventBus,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig, events: EventBus) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            fallbacks: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Append `fallback` to `primary`'s chain.  Duplicates and self-references
    /// are ignored.
    pub fn register_fallback(&self, primary: &str, fallback: &str) {
        if primary == fallback {
            tracing::warn!(module_id = %primary, "ignoring self-referencing fallback");
            return;
        }
        let mut chain = self.fallbacks.entry(primary.to_owned()).or_default();
        if !chain.iter().any(|f| f == fallback) {
            chain.push(fallback.to_owned());
            tracing::debug!(module_id = %primary, %fallback, "fallback registered");
        }
    }

    /// `primary`'s fallback chain in registration order.
    pub fn fallbacks(&self, primary: &str) -> Vec<String> {
        self.fallbacks
            .get(primary)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    pub fn circuit_state(&self, module_id: &str) -> CircuitState {
        self.circuits
            .get(module_id)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    /// Admit or reject a call to `module_id`.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// admits exactly one trial call.
    pub fn check_circuit(&self, module_id: &str) -> Result<()> {
        let Some(mut circuit) = self.circuits.get_mut(module_id) else {
            return Ok(());
        };
        let now = Instant::now();
        let state = circuit.state;
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.cool_down);
                if cooled {
                    tracing::info!(module_id = %module_id, "circuit half-open, admitting trial call");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.circuit_open_error(module_id, &circuit, now))
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back does not wedge the circuit.
                let stale = circuit
                    .trial_started
                    .is_none_or(|at| now.duration_since(at) >= self.config.cool_down);
                if stale {
                    circuit.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.circuit_open_error(module_id, &circuit, now))
                }
            }
        }
    }

    pub fn record_success(&self, module_id: &str) {
        let Some(mut circuit) = self.circuits.get_mut(module_id) else {
            return;
        };
        let was = circuit.state;
        *circuit = Circuit::new();
        drop(circuit);
        if was != CircuitState::Closed {
            tracing::info!(module_id = %module_id, "circuit closed");
            self.events.publish(RuntimeEvent::CircuitClosed {
                module_id: module_id.to_owned(),
            });
        }
    }

    pub fn record_failure(&self, module_id: &str) {
        let mut circuit = self
            .circuits
            .entry(module_id.to_owned())
            .or_insert_with(Circuit::new);
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        let trips = match circuit.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => circuit.consecutive_failures >= self.config.failure_threshold.max(1),
            CircuitState::Open => false,
        };
        if !trips {
            return;
        }
        circuit.state = CircuitState::Open;
        circuit.opened_at = Some(Instant::now());
        circuit.trial_started = None;
        let failures = circuit.consecutive_failures;
        drop(circuit);

        tracing::warn!(module_id = %module_id, consecutive_failures = failures, "circuit opened");
        self.events.publish(RuntimeEvent::CircuitOpened {
            module_id: module_id.to_owned(),
            consecutive_failures: failures,
        });
    }

    fn circuit_open_error(&self, module_id: &str, circuit: &Circuit, now: Instant) -> ModuleError {
        let retry_after = circuit
            .opened_at
            .map(|at| self.config.cool_down.saturating_sub(now.duration_since(at)))
            .unwrap_or_default();
        ModuleError::new(
            ErrorCode::CircuitOpen,
            format!("circuit for module '{module_id}' is open"),
        )
        .with_detail("module_id", module_id)
        .with_detail("consecutive_failures", circuit.consecutive_failures)
        .with_detail("retry_after_ms", retry_after.as_millis() as u64)
    }

    /// Retry a failed call.
    ///
    /// `error` is the failure of the original call, which the caller has
    /// already recorded.  A non-recoverable `error` returns immediately with
    /// `attempted: false`.  Otherwise `retry` is invoked, with exponential
    /// backoff between invocations, until it succeeds, fails with a
    /// non-recoverable error, the circuit opens, or the attempt budget is
    /// spent.
    pub async fn attempt_recovery<T, F, Fut>(
        &self,
        module_id: &str,
        error: &ModuleError,
        mut retry: F,
    ) -> RecoveryAttempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = AttemptState::Classifying;
        let mut attempt = RecoveryAttempt {
            attempted: false,
            success: false,
            attempts: 0,
            retried: Vec::new(),
            result: Err(error.clone()),
        };
        if !error.recoverable {
            tracing::debug!(module_id = %module_id, code = %error.code, ?state, "error not recoverable");
            return attempt;
        }
        attempt.attempted = true;

        let mut last = error.clone();
        for retry_no in 1..self.config.max_attempts.max(1) {
            state = AttemptState::RetryScheduled;
            let delay = self.config.delay_for(retry_no);
            tracing::info!(
                module_id = %module_id,
                attempt = retry_no,
                delay_ms = delay.as_millis() as u64,
                code = %last.code,
                ?state,
                "retrying failed call"
            );
            self.events.publish(RuntimeEvent::RetryScheduled {
                module_id: module_id.to_owned(),
                attempt: retry_no,
                delay,
                code: last.code,
            });
            attempt.retried.push(last.code);
            tokio::time::sleep(delay).await;

            if let Err(open) = self.check_circuit(module_id) {
                state = AttemptState::CircuitOpen;
                tracing::warn!(module_id = %module_id, ?state, "circuit open, abandoning retries");
                attempt.result = Err(open);
                return attempt;
            }

            state = AttemptState::Attempting;
            attempt.attempts += 1;
            tracing::trace!(module_id = %module_id, attempt = retry_no, ?state);
            match retry().await {
                Ok(value) => {
                    state = AttemptState::Succeeded;
                    self.record_success(module_id);
                    tracing::info!(module_id = %module_id, attempts = attempt.attempts, ?state, "recovered");
                    attempt.success = true;
                    attempt.result = Ok(value);
                    return attempt;
                }
                Err(err) => {
                    state = AttemptState::Classifying;
                    self.record_failure(module_id);
                    tracing::debug!(
                        module_id = %module_id,
                        code = %err.code,
                        recoverable = err.recoverable,
                        ?state,
                        "retry failed"
                    );
                    let recoverable = err.recoverable;
                    last = err;
                    if !recoverable {
                        break;
                    }
                }
            }
        }

        state = AttemptState::Failed;
        tracing::warn!(module_id = %module_id, code = %last.code, attempts = attempt.attempts, ?state, "recovery failed");
        attempt.result = Err(last);
        attempt
    }
}

impl std::fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPolicy")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            cool_down: Duration::from_millis(50),
            ..RecoveryConfig::default()
        }
    }

    fn policy(config: RecoveryConfig) -> RecoveryPolicy {
        RecoveryPolicy::new(config, EventBus::new(64))
    }

    fn timeout() -> ModuleError {
        ModuleError::new(ErrorCode::TimeoutError, "slow")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RecoveryConfig::default();
        assert_eq!(config.delay_for(1), Duration::from_millis(50));
        assert_eq!(config.delay_for(2), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(200));
        assert_eq!(config.delay_for(30), Duration::from_secs(1));
    }

    #[test]
    fn config_reads_milliseconds() {
        let config: RecoveryConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "cool_down_ms": 1500}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.cool_down, Duration::from_millis(1500));
        assert_eq!(config.retry_delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn non_recoverable_errors_are_not_retried() {
        let p = policy(fast_config());
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = p
            .attempt_recovery("m", &ModuleError::invalid_input("bad"), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ModuleError>(())
            })
            .await;
        assert!(!attempt.attempted);
        assert_eq!(attempt.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(attempt.result.unwrap_err().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let p = policy(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let attempt = p
            .attempt_recovery("m", &timeout(), || {
                let calls = calls.clone();
                async move {
                    // Original call already failed once; fail once more.
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(timeout())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert!(attempt.attempted);
        assert!(attempt.success);
        assert_eq!(attempt.attempts, 2);
        assert_eq!(attempt.retried, vec![ErrorCode::TimeoutError; 2]);
        assert_eq!(attempt.result.unwrap(), "done");
    }

    #[tokio::test]
    async fn budget_is_respected() {
        let p = policy(fast_config());
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = p
            .attempt_recovery("m", &timeout(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(timeout())
            })
            .await;
        assert!(!attempt.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(attempt.attempts, 2);
    }

    #[tokio::test]
    async fn retry_stops_on_non_recoverable_failure() {
        let p = policy(RecoveryConfig {
            max_attempts: 10,
            ..fast_config()
        });
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = p
            .attempt_recovery("m", &timeout(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ModuleError::execution("broken"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(attempt.result.unwrap_err().code, ErrorCode::ExecutionError);
    }

    #[tokio::test]
    async fn circuit_opens_and_half_opens() {
        let p = policy(RecoveryConfig {
            failure_threshold: 3,
            ..fast_config()
        });
        let mut rx = p.events.subscribe();

        for _ in 0..3 {
            assert!(p.check_circuit("m").is_ok());
            p.record_failure("m");
        }
        assert_eq!(p.circuit_state("m"), CircuitState::Open);
        let err = p.check_circuit("m").unwrap_err();
        assert_eq!(err.code, ErrorCode::CircuitOpen);
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            RuntimeEvent::CircuitOpened { consecutive_failures: 3, .. }
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(p.check_circuit("m").is_ok());
        assert_eq!(p.circuit_state("m"), CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(p.check_circuit("m").is_err());

        p.record_failure("m");
        assert_eq!(p.circuit_state("m"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(p.check_circuit("m").is_ok());
        p.record_success("m");
        assert_eq!(p.circuit_state("m"), CircuitState::Closed);
        assert!(p.check_circuit("m").is_ok());
    }

    #[tokio::test]
    async fn open_circuit_cuts_retries_short() {
        let p = policy(RecoveryConfig {
            failure_threshold: 1,
            max_attempts: 5,
            ..fast_config()
        });
        p.record_failure("m");
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = p
            .attempt_recovery("m", &timeout(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ModuleError>(())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(attempt.result.unwrap_err().code, ErrorCode::CircuitOpen);
    }

    #[test]
    fn fallback_chains_keep_order_without_duplicates() {
        let p = policy(fast_config());
        p.register_fallback("a", "b");
        p.register_fallback("a", "c");
        p.register_fallback("a", "b");
        p.register_fallback("a", "a");
        assert_eq!(p.fallbacks("a"), vec!["b", "c"]);
        assert!(p.fallbacks("zzz").is_empty());
    }
}
