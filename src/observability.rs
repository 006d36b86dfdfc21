use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Orchestrator-level counters, one instance per orchestrator
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    pub tasks_submitted: AtomicU64,
    pub tasks_dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub tasks_requeued: AtomicU64,
    pub results_received: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub workers_restarted: AtomicU64,
    pub workers_retired: AtomicU64,
    pub scale_ups: AtomicU64,
    pub scale_downs: AtomicU64,
    pub coordination_ticks: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub dispatch_failures: u64,
    pub tasks_requeued: u64,
    pub results_received: u64,
    pub workers_spawned: u64,
    pub workers_restarted: u64,
    pub workers_retired: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub coordination_ticks: u64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> CoordinationStats {
        CoordinationStats {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            tasks_requeued: self.tasks_requeued.load(Ordering::Relaxed),
            results_received: self.results_received.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_restarted: self.workers_restarted.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
            coordination_ticks: self.coordination_ticks.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            tasks_submitted = stats.tasks_submitted,
            tasks_dispatched = stats.tasks_dispatched,
            dispatch_failures = stats.dispatch_failures,
            tasks_requeued = stats.tasks_requeued,
            workers_spawned = stats.workers_spawned,
            workers_restarted = stats.workers_restarted,
            scale_ups = stats.scale_ups,
            scale_downs = stats.scale_downs,
            "Coordination metrics"
        );
    }
}

/// Time an operation and log its duration on `finish`
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_stats() {
        let metrics = CoordinationMetrics::new();
        CoordinationMetrics::incr(&metrics.tasks_submitted);
        CoordinationMetrics::incr(&metrics.tasks_submitted);
        CoordinationMetrics::incr(&metrics.scale_ups);

        let stats = metrics.get_stats();
        assert_eq!(stats.tasks_submitted, 2);
        assert_eq!(stats.scale_ups, 1);
        assert_eq!(stats.workers_restarted, 0);
    }

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = OperationTimer::new("tick");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish() >= Duration::from_millis(5));
    }
}
