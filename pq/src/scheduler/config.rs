//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max dispatch cycles running at once, across all endpoints
    #[serde(default = "default_pool_size", rename = "pool-size")]
    pub pool_size: usize,

    /// Seconds between polls for endpoints with due work
    #[serde(default = "default_poll_interval_secs", rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Seconds to wait for active cycles on shutdown
    #[serde(default = "default_shutdown_timeout_secs", rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,

    /// Also schedule endpoints with no due work, so they get probed
    #[serde(default, rename = "checkin-idle")]
    pub checkin_idle: bool,
}

fn default_pool_size() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            poll_interval_secs: default_poll_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            checkin_idle: false,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert!(!config.checkin_idle);
    }

    #[test]
    fn test_partial_yaml() {
        let config: SchedulerConfig = serde_yaml::from_str("pool-size: 16\ncheckin-idle: true\n").unwrap();
        assert_eq!(config.pool_size, 16);
        assert!(config.checkin_idle);
        assert_eq!(config.poll_interval_secs, 60);
    }
}
