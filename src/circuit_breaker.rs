//! Per-key circuit breaker.
//!
//! Each circuit tracks *consecutive* successes and failures for one entity
//! (the orchestrator uses `agent:<id>`). A run of failures opens the circuit,
//! the reset timeout lets a bounded number of trial calls through, and enough
//! trial successes close it again. One failed trial reopens it immediately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time an open circuit waits before allowing trial calls
    pub reset_timeout_ms: u64,
    /// Trial calls permitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive event counters for one circuit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub failures: u32,
    pub successes: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

/// Point-in-time view of a circuit, as reported by `get_circuit_info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub circuit_id: String,
    pub state: CircuitState,
    #[serde(flatten)]
    pub stats: CircuitStats,
    pub half_open_calls: u32,
    /// Seconds until an open circuit becomes eligible for trial calls
    pub retry_after_secs: Option<f64>,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    stats: CircuitStats,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            stats: CircuitStats::default(),
            half_open_calls: 0,
            last_failure_at: None,
        }
    }
}

impl Circuit {
    fn reset_timeout_elapsed(&self, reset_timeout: Duration) -> bool {
        self.last_failure_at
            .map(|at| at.elapsed() >= reset_timeout)
            .unwrap_or(true)
    }

    fn info(&self, circuit_id: &str, reset_timeout: Duration) -> CircuitInfo {
        let retry_after_secs = match (self.state, self.last_failure_at) {
            (CircuitState::Open, Some(at)) => {
                Some(reset_timeout.saturating_sub(at.elapsed()).as_secs_f64())
            }
            (CircuitState::Open, None) => Some(0.0),
            _ => None,
        };

        CircuitInfo {
            circuit_id: circuit_id.to_string(),
            state: self.state,
            stats: self.stats.clone(),
            half_open_calls: self.half_open_calls,
            retry_after_secs,
        }
    }
}

/// Thread-safe registry of circuits keyed by arbitrary strings
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may proceed. Moves an expired open circuit to half-open
    /// and consumes one trial call while half-open.
    pub fn can_execute(&self, circuit_id: &str) -> bool {
        let reset_timeout = self.config.reset_timeout();
        let mut circuits = self.circuits();
        let circuit = circuits.entry(circuit_id.to_string()).or_default();

        if circuit.state == CircuitState::Open {
            if !circuit.reset_timeout_elapsed(reset_timeout) {
                return false;
            }
            circuit.state = CircuitState::HalfOpen;
            circuit.half_open_calls = 0;
            info!(circuit_id = %circuit_id, "Circuit half-open, allowing trial calls");
        }

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if circuit.half_open_calls < self.config.half_open_max_calls {
                    circuit.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Same answer `can_execute` would give, without changing any state.
    pub fn is_available(&self, circuit_id: &str) -> bool {
        let circuits = self.circuits();
        match circuits.get(circuit_id) {
            None => true,
            Some(circuit) => match circuit.state {
                CircuitState::Closed => true,
                CircuitState::Open => circuit.reset_timeout_elapsed(self.config.reset_timeout()),
                CircuitState::HalfOpen => circuit.half_open_calls < self.config.half_open_max_calls,
            },
        }
    }

    pub fn record_success(&self, circuit_id: &str) {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(circuit_id.to_string()).or_default();

        circuit.stats.successes += 1;
        circuit.stats.failures = 0;
        circuit.stats.last_success_time = Some(Utc::now());

        if circuit.state == CircuitState::HalfOpen
            && circuit.stats.successes >= self.config.success_threshold
        {
            circuit.state = CircuitState::Closed;
            circuit.half_open_calls = 0;
            info!(
                circuit_id = %circuit_id,
                successes = circuit.stats.successes,
                "Circuit closed after successful trial calls"
            );
        }
    }

    pub fn record_failure(&self, circuit_id: &str) {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(circuit_id.to_string()).or_default();

        circuit.stats.failures += 1;
        circuit.stats.successes = 0;
        circuit.stats.last_failure_time = Some(Utc::now());
        circuit.last_failure_at = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed if circuit.stats.failures >= self.config.failure_threshold => {
                circuit.state = CircuitState::Open;
                warn!(
                    circuit_id = %circuit_id,
                    failures = circuit.stats.failures,
                    "Circuit opened after consecutive failures"
                );
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.half_open_calls = 0;
                warn!(circuit_id = %circuit_id, "Trial call failed, circuit reopened");
            }
            _ => {
                debug!(
                    circuit_id = %circuit_id,
                    failures = circuit.stats.failures,
                    state = ?circuit.state,
                    "Recorded circuit failure"
                );
            }
        }
    }

    /// Force the circuit closed and forget its history
    pub fn reset(&self, circuit_id: &str) {
        if self.circuits().remove(circuit_id).is_some() {
            info!(circuit_id = %circuit_id, "Circuit reset");
        }
    }

    pub fn state(&self, circuit_id: &str) -> CircuitState {
        self.circuits()
            .get(circuit_id)
            .map(|circuit| circuit.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn get_circuit_info(&self, circuit_id: &str) -> CircuitInfo {
        let reset_timeout = self.config.reset_timeout();
        match self.circuits().get(circuit_id) {
            Some(circuit) => circuit.info(circuit_id, reset_timeout),
            None => Circuit::default().info(circuit_id, reset_timeout),
        }
    }

    pub fn all_circuits(&self) -> BTreeMap<String, CircuitInfo> {
        let reset_timeout = self.config.reset_timeout();
        self.circuits()
            .iter()
            .map(|(id, circuit)| (id.clone(), circuit.info(id, reset_timeout)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_ms,
            half_open_max_calls: 2,
        })
    }

    #[test]
    fn test_unknown_circuit_is_closed() {
        let cb = breaker(1_000);
        assert!(cb.can_execute("agent:a"));
        assert_eq!(cb.state("agent:a"), CircuitState::Closed);
        assert!(cb.get_circuit_info("agent:never").retry_after_secs.is_none());
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = breaker(60_000);
        cb.record_failure("agent:a");
        cb.record_failure("agent:a");
        assert_eq!(cb.state("agent:a"), CircuitState::Closed);
        assert!(cb.can_execute("agent:a"));

        cb.record_failure("agent:a");
        assert_eq!(cb.state("agent:a"), CircuitState::Open);
        assert!(!cb.can_execute("agent:a"));
        assert!(!cb.is_available("agent:a"));

        let info = cb.get_circuit_info("agent:a");
        assert_eq!(info.stats.failures, 3);
        assert!(info.retry_after_secs.unwrap() > 50.0);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(60_000);
        cb.record_failure("agent:a");
        cb.record_failure("agent:a");
        cb.record_success("agent:a");
        cb.record_failure("agent:a");
        cb.record_failure("agent:a");

        assert_eq!(cb.state("agent:a"), CircuitState::Closed);
        let stats = cb.get_circuit_info("agent:a").stats;
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.successes, 0);
    }

    #[test]
    fn test_half_open_after_reset_timeout_and_trial_limit() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("agent:a");
        }
        assert!(!cb.can_execute("agent:a"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.is_available("agent:a"));
        assert_eq!(cb.state("agent:a"), CircuitState::Open);

        assert!(cb.can_execute("agent:a"));
        assert_eq!(cb.state("agent:a"), CircuitState::HalfOpen);
        assert!(cb.can_execute("agent:a"));
        assert!(!cb.can_execute("agent:a"), "trial calls are capped");
    }

    #[test]
    fn test_single_half_open_failure_reopens() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("agent:a");
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute("agent:a"));

        cb.record_failure("agent:a");
        assert_eq!(cb.state("agent:a"), CircuitState::Open);
        assert!(!cb.can_execute("agent:a"));
    }

    #[test]
    fn test_half_open_successes_close_circuit() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("agent:a");
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute("agent:a"));

        cb.record_success("agent:a");
        assert_eq!(cb.state("agent:a"), CircuitState::HalfOpen);
        cb.record_success("agent:a");
        assert_eq!(cb.state("agent:a"), CircuitState::Closed);
        assert!(cb.can_execute("agent:a"));
    }

    #[test]
    fn test_reset_clears_stats() {
        let cb = breaker(60_000);
        for _ in 0..3 {
            cb.record_failure("agent:a");
        }
        cb.reset("agent:a");

        let info = cb.get_circuit_info("agent:a");
        assert_eq!(info.state, CircuitState::Closed);
        assert_eq!(info.stats, CircuitStats::default());
        assert!(cb.all_circuits().is_empty());
    }

    #[test]
    fn test_concurrent_failures_are_serialized() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1_000,
            ..CircuitBreakerConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = std::sync::Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cb.record_failure("agent:shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cb.get_circuit_info("agent:shared").stats.failures, 400);
    }
}
