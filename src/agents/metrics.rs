use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cumulative per-worker counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_time_ms: u64,
    pub average_execution_time_ms: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors_encountered: u64,
    pub last_active: DateTime<Utc>,
    pub success_rate: f64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            total_execution_time_ms: 0,
            average_execution_time_ms: 0.0,
            messages_sent: 0,
            messages_received: 0,
            errors_encountered: 0,
            last_active: Utc::now(),
            success_rate: 1.0,
        }
    }
}

impl AgentMetrics {
    pub fn record_task(&mut self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
            self.errors_encountered += 1;
        }
        self.total_execution_time_ms += elapsed.as_millis() as u64;

        let finished = self.tasks_completed + self.tasks_failed;
        self.average_execution_time_ms = self.total_execution_time_ms as f64 / finished as f64;
        self.success_rate = self.tasks_completed as f64 / finished as f64;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_active).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_defaults_to_one() {
        assert_eq!(AgentMetrics::default().success_rate, 1.0);
    }

    #[test]
    fn test_record_task_updates_rates() {
        let mut metrics = AgentMetrics::default();
        metrics.record_task(true, Duration::from_millis(100));
        metrics.record_task(true, Duration::from_millis(200));
        metrics.record_task(false, Duration::from_millis(300));

        assert_eq!(metrics.tasks_completed, 2);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.errors_encountered, 1);
        assert_eq!(metrics.total_execution_time_ms, 600);
        assert!((metrics.average_execution_time_ms - 200.0).abs() < f64::EPSILON);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let mut metrics = AgentMetrics::default();
        metrics.last_active = Utc::now() - chrono::Duration::seconds(5);
        assert!(metrics.idle_for() >= Duration::from_secs(5));

        metrics.touch();
        assert!(metrics.idle_for() < Duration::from_secs(1));
    }
}
