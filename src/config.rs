use std::time::Duration;

use crate::queue::scheduler::ScheduleAlgorithm;

/// Default port workers connect to
pub const DEFAULT_PORT: u16 = 9123;

/// Tunables of a `Queue`
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How often a task is retried after a lost worker or a failed transfer before it is given up
    pub retry_budget: u32,
    /// A worker that has not been heard from for this long is considered lost
    pub liveness_window: Duration,
    /// Idle time after which the master pings a worker
    pub keepalive_interval: Duration,
    pub algorithm: ScheduleAlgorithm,
    /// Disconnect workers whose current task runs longer than this multiple of the average
    /// execution time. Off if `None`.
    pub fast_abort_multiplier: Option<f64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            liveness_window: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            algorithm: ScheduleAlgorithm::default(),
            fast_abort_multiplier: None,
        }
    }
}

impl QueueConfig {
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_liveness_window(mut self, liveness_window: Duration) -> Self {
        self.liveness_window = liveness_window;
        self
    }

    pub fn with_keepalive_interval(mut self, keepalive_interval: Duration) -> Self {
        self.keepalive_interval = keepalive_interval;
        self
    }

    pub fn with_algorithm(mut self, algorithm: ScheduleAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Multipliers below 1 switch fast abort off
    pub fn with_fast_abort(mut self, multiplier: f64) -> Self {
        self.fast_abort_multiplier = if multiplier >= 1.0 {
            Some(multiplier)
        } else {
            None
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = QueueConfig::default()
            .with_retry_budget(0)
            .with_liveness_window(Duration::from_secs(5))
            .with_keepalive_interval(Duration::from_secs(1))
            .with_algorithm(ScheduleAlgorithm::Fcfs)
            .with_fast_abort(3.0);
        assert_eq!(config.retry_budget, 0);
        assert_eq!(config.liveness_window, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.algorithm, ScheduleAlgorithm::Fcfs);
        assert_eq!(config.fast_abort_multiplier, Some(3.0));

        assert_eq!(
            config.with_fast_abort(0.5).fast_abort_multiplier,
            None
        );
    }
}
