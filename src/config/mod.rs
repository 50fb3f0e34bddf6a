//! Configuration module for Basalt.

use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a Basalt control-plane node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasaltConfig {
    /// Replication manager configuration.
    pub replication: ReplicationConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl BasaltConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BasaltError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BasaltError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.replication.validate()
    }
}

/// Replication manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Interval at which the replication monitor processes all containers.
    pub interval: Duration,
    /// Deadline for replication and deletion commands sent to datanodes.
    /// Past it the command is considered lost and is reissued.
    pub event_timeout: Duration,
    /// Minimum number of healthy replicas which must remain available for a
    /// node to enter maintenance.
    pub maintenance_replica_minimum: usize,
    /// Grace period after leaving safe mode before the monitor takes action.
    pub wait_after_safe_mode_exit: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            event_timeout: Duration::from_secs(30 * 60),
            maintenance_replica_minimum: 2,
            wait_after_safe_mode_exit: Duration::from_secs(5 * 60),
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(BasaltError::InvalidConfig {
                field: "replication.interval".to_string(),
                reason: "monitor interval must be non-zero".to_string(),
            });
        }
        if self.event_timeout.is_zero() {
            return Err(BasaltError::InvalidConfig {
                field: "replication.event_timeout".to_string(),
                reason: "event timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON-structured logs.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.event_timeout, Duration::from_secs(1800));
        assert_eq!(config.maintenance_replica_minimum, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = ReplicationConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BasaltError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = BasaltConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: BasaltConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.replication.interval,
            config.replication.interval
        );
    }
}
