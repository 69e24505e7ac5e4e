use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::engine::{EngineConfig, ReconcilerConfig, SchedulerConfig};
use crate::persistence::PersistenceConfig;
use crate::types::{QuotaPrefix, DEFAULT_QUOTA_PREFIX};

/// Quota sync - keeps per-user quota nodes in line with groups and bonuses
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Directory holding the bonus ledger
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Reserved prefix of quota permission nodes
    #[arg(long, default_value = DEFAULT_QUOTA_PREFIX)]
    pub quota_prefix: String,

    /// Debounce delay in milliseconds for topology-triggered reconciliation
    #[arg(long, default_value = "1000")]
    pub reconcile_delay_ms: u64,

    /// Delay in milliseconds before reconciling a user who just joined
    #[arg(long, default_value = "1000")]
    pub join_delay_ms: u64,

    /// Attempts for a quota node write before giving up
    #[arg(long, default_value = "3")]
    pub max_write_attempts: u32,

    /// Pause in milliseconds between node write attempts
    #[arg(long, default_value = "50")]
    pub write_retry_delay_ms: u64,

    /// Capacity of the scheduler request channel
    #[arg(long, default_value = "1024")]
    pub channel_size: usize,

    /// Milliseconds to wait for in-flight reconciliations at shutdown
    #[arg(long, default_value = "5000")]
    pub shutdown_grace_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Parse configuration from command line arguments
    pub fn parse_args() -> Self {
        Config::parse()
    }

    pub fn quota_prefix(&self) -> QuotaPrefix {
        QuotaPrefix::new(&self.quota_prefix)
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig::new(&self.data_dir)
    }

    /// Build the engine configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            prefix: self.quota_prefix(),
            persistence: self.persistence_config(),
            scheduler: SchedulerConfig {
                reconcile_delay: Duration::from_millis(self.reconcile_delay_ms),
                join_delay: Duration::from_millis(self.join_delay_ms),
                channel_capacity: self.channel_size,
                shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            },
            reconciler: ReconcilerConfig {
                max_write_attempts: self.max_write_attempts,
                write_retry_delay: Duration::from_millis(self.write_retry_delay_ms),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            quota_prefix: DEFAULT_QUOTA_PREFIX.to_string(),
            reconcile_delay_ms: 1000,
            join_delay_ms: 1000,
            max_write_attempts: 3,
            write_retry_delay_ms: 50,
            channel_size: 1024,
            shutdown_grace_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli_defaults() {
        let parsed = Config::try_parse_from(["quota-sync"]).unwrap();
        let default = Config::default();

        assert_eq!(parsed.data_dir, default.data_dir);
        assert_eq!(parsed.quota_prefix, default.quota_prefix);
        assert_eq!(parsed.reconcile_delay_ms, default.reconcile_delay_ms);
        assert_eq!(parsed.join_delay_ms, default.join_delay_ms);
        assert_eq!(parsed.max_write_attempts, default.max_write_attempts);
        assert_eq!(parsed.write_retry_delay_ms, default.write_retry_delay_ms);
        assert_eq!(parsed.channel_size, default.channel_size);
        assert_eq!(parsed.shutdown_grace_ms, default.shutdown_grace_ms);
        assert_eq!(parsed.log_level, default.log_level);
    }

    #[test]
    fn test_engine_config_from_flags() {
        let config = Config::try_parse_from([
            "quota-sync",
            "--data-dir",
            "/tmp/bonus",
            "--quota-prefix",
            "homes.max.",
            "--reconcile-delay-ms",
            "250",
            "--max-write-attempts",
            "5",
        ])
        .unwrap();

        let engine = config.engine_config();
        assert_eq!(engine.prefix.as_str(), "homes.max.");
        assert_eq!(
            engine.persistence.ledger_path(),
            PathBuf::from("/tmp/bonus/bonus_ledger.bin")
        );
        assert_eq!(engine.scheduler.reconcile_delay, Duration::from_millis(250));
        assert_eq!(engine.scheduler.join_delay, Duration::from_millis(1000));
        assert_eq!(engine.reconciler.max_write_attempts, 5);
    }
}
