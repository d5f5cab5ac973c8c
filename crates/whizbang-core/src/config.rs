//! Configuration surface (spec.md §6 "Configuration surface").
//!
//! Loaded the way `control::config::load_settings` loads `Settings`: a base
//! file, an environment-specific overlay, then environment variables, all
//! merged via the `config` crate. Unlike a CLI-hosted `Settings`, this is a
//! library: callers construct and own a `CoordinatorConfig` rather than
//! reaching for a process-global `OnceCell` (spec.md §9: "Global static
//! state ... becomes explicit dependencies").

use serde::{Deserialize, Serialize};

use crate::errors::CoordinatorError;
use crate::status::WorkBatchFlags;

/// Bit flags recognized in `config.flags` (spec.md §3.1 `WorkBatchFlags`,
/// §6 `flags.DebugMode`). Only `DEBUG_MODE` is meaningful as an *input*
/// flag; `NEWLY_STORED`/`ORPHANED` are output-only annotations the
/// procedure attaches to returned rows.
pub const DEBUG_MODE: WorkBatchFlags = WorkBatchFlags::DEBUG_MODE;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Duration of a fresh lease, in seconds. Default 300.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
    /// An instance is reaped once its heartbeat gap exceeds this, in
    /// seconds. Default 600. Must exceed `lease_seconds`.
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: i64,
    /// `P`, the total partition count. Default 10000. Changing this value
    /// requires coordinated redeployment (spec.md §6).
    #[serde(default = "default_partition_count")]
    pub partition_count: i32,
    /// Explicit cap for load-balanced testing. `None` means "use only the
    /// fair-share cap" (spec.md §4.3 step 3).
    #[serde(default)]
    pub max_partitions_per_instance: Option<i32>,
    /// Raw flag bits, of which only `DebugMode` (bit 2) is recognized.
    #[serde(default)]
    pub flags: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            partition_count: default_partition_count(),
            max_partitions_per_instance: None,
            flags: 0,
        }
    }
}

fn default_lease_seconds() -> i64 {
    300
}

fn default_stale_threshold_seconds() -> i64 {
    600
}

fn default_partition_count() -> i32 {
    10_000
}

impl CoordinatorConfig {
    pub fn debug_mode(&self) -> bool {
        WorkBatchFlags(self.flags).contains(DEBUG_MODE)
    }

    /// Validates the tie-break noted in spec.md §4.3: `staleThresholdSeconds`
    /// must exceed the longest expected `leaseSeconds`, or lease expiry and
    /// instance reap may race.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.stale_threshold_seconds <= self.lease_seconds {
            return Err(CoordinatorError::Config(format!(
                "staleThresholdSeconds ({}) must exceed leaseSeconds ({})",
                self.stale_threshold_seconds, self.lease_seconds
            )));
        }
        if self.partition_count <= 0 {
            return Err(CoordinatorError::Config(
                "partitionCount must be positive".to_string(),
            ));
        }
        if let Some(cap) = self.max_partitions_per_instance {
            if cap < 0 {
                return Err(CoordinatorError::Config(
                    "maxPartitionsPerInstance must not be negative".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Loads configuration the way `control::config` does: a required base
    /// file, an optional environment-specific overlay, then environment
    /// variables prefixed `WHIZBANG_`, each layer overriding the last.
    pub fn load(config_dir: &std::path::Path, app_env: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(config_dir.join("base")).required(true))
            .add_source(config::File::from(config_dir.join(app_env)).required(false))
            .add_source(config::Environment::with_prefix("WHIZBANG"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.lease_seconds, 300);
        assert_eq!(config.stale_threshold_seconds, 600);
        assert_eq!(config.partition_count, 10_000);
        assert!(config.max_partitions_per_instance.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_stale_threshold_not_exceeding_lease() {
        let mut config = CoordinatorConfig {
            stale_threshold_seconds: 300,
            lease_seconds: 300,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.stale_threshold_seconds = 301;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_mode_reads_flag_bit() {
        let mut config = CoordinatorConfig::default();
        assert!(!config.debug_mode());
        config.flags = DEBUG_MODE.0;
        assert!(config.debug_mode());
    }
}
