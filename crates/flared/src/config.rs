use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the mesh node daemon.
#[derive(Parser)]
#[command(name = "flared", about = "FLARE mesh node daemon")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Local API listen address override.
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Node display name override.
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the mesh node daemon.
    Start,
    /// Show daemon status.
    Status,
    /// Originate an alert and flood it across the mesh.
    Send {
        /// Alert text (at most 500 characters).
        text: String,
    },
    /// Stream alerts and status events from the daemon.
    Watch,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Node display name shown to peers; generated at startup when empty.
    pub name: String,
    /// Local API listen address (`host:port`).
    pub listen: String,
    /// UDP port used for discovery beacons.
    pub discovery_port: u16,
    /// TCP port peers connect to; 0 picks an ephemeral port.
    pub transport_port: u16,
    /// Maximum alert text length accepted from the host.
    pub max_alert_len: usize,
    /// Capacity of the duplicate-suppression set.
    pub seen_capacity: usize,
    /// Relay engine timing parameters.
    pub timing: TimingConfig,
}

/// Relay engine timing parameters, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Delay between advertising start and the first discovery start.
    pub discovery_start_delay_ms: u64,
    /// Interval of the discovery maintenance sweep.
    pub maintenance_interval_ms: u64,
    /// Interval of the periodic status check.
    pub status_interval_ms: u64,
    /// Delay of the post-disconnect reconnect probe.
    pub reconnect_probe_delay_ms: u64,
    /// Delay before retrying a failed connection request.
    pub connect_retry_delay_ms: u64,
    /// Delay before retrying a failed advertising or discovery start.
    pub transport_retry_delay_ms: u64,
    /// Settle delay between a discovery stop completing and a pending
    /// start being issued.
    pub settle_delay_ms: u64,
    /// How long a lost peer stays eligible for reconnection.
    pub lost_window_ms: u64,
}

impl TimingConfig {
    /// Delay before the first discovery start.
    #[must_use]
    pub fn discovery_start_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_start_delay_ms)
    }

    /// Discovery maintenance interval.
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Status check interval.
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Post-disconnect reconnect probe delay.
    #[must_use]
    pub fn reconnect_probe_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_probe_delay_ms)
    }

    /// Connection request retry delay.
    #[must_use]
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Advertising/discovery start retry delay.
    #[must_use]
    pub fn transport_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transport_retry_delay_ms)
    }

    /// Settle delay after a discovery stop completes.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Reconnection window for lost peers.
    #[must_use]
    pub fn lost_window(&self) -> Duration {
        Duration::from_millis(self.lost_window_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_start_delay_ms: 2_000,
            maintenance_interval_ms: 30_000,
            status_interval_ms: 10_000,
            reconnect_probe_delay_ms: 5_000,
            connect_retry_delay_ms: 3_000,
            transport_retry_delay_ms: 5_000,
            settle_delay_ms: 1_000,
            lost_window_ms: 120_000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            listen: "127.0.0.1:7710".to_string(),
            discovery_port: 7711,
            transport_port: 0,
            max_alert_len: flare_common::types::MAX_ALERT_TEXT,
            seen_capacity: crate::seen::DEFAULT_SEEN_CAPACITY,
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.len() > 64 {
            return Err("name must be at most 64 characters".to_string());
        }

        if self.listen.is_empty() {
            return Err("listen address must not be empty".to_string());
        }
        if !self.listen.contains(':') {
            return Err(format!(
                "listen address must be host:port, got: {}",
                self.listen
            ));
        }

        if self.discovery_port == 0 {
            return Err("discovery_port must be greater than 0".to_string());
        }

        if self.max_alert_len == 0 {
            return Err("max_alert_len must be greater than 0".to_string());
        }

        if self.seen_capacity == 0 {
            return Err("seen_capacity must be greater than 0".to_string());
        }

        let timing = &self.timing;
        for (value, field) in [
            (timing.maintenance_interval_ms, "timing.maintenance_interval_ms"),
            (timing.status_interval_ms, "timing.status_interval_ms"),
            (timing.reconnect_probe_delay_ms, "timing.reconnect_probe_delay_ms"),
            (timing.connect_retry_delay_ms, "timing.connect_retry_delay_ms"),
            (timing.transport_retry_delay_ms, "timing.transport_retry_delay_ms"),
            (timing.settle_delay_ms, "timing.settle_delay_ms"),
            (timing.lost_window_ms, "timing.lost_window_ms"),
        ] {
            if value == 0 {
                return Err(format!("{field} must be greater than 0"));
            }
        }

        if timing.lost_window_ms < timing.maintenance_interval_ms {
            return Err(
                "timing.lost_window_ms must be >= timing.maintenance_interval_ms".to_string(),
            );
        }

        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let defaults = NodeConfig::default();
    let timing = TimingConfig::default();
    let mut builder = config::Config::builder()
        .set_default("name", defaults.name.as_str())?
        .set_default("listen", defaults.listen.as_str())?
        .set_default("discovery_port", i64::from(defaults.discovery_port))?
        .set_default("transport_port", i64::from(defaults.transport_port))?
        .set_default("max_alert_len", defaults.max_alert_len as i64)?
        .set_default("seen_capacity", defaults.seen_capacity as i64)?
        .set_default(
            "timing.discovery_start_delay_ms",
            timing.discovery_start_delay_ms as i64,
        )?
        .set_default(
            "timing.maintenance_interval_ms",
            timing.maintenance_interval_ms as i64,
        )?
        .set_default("timing.status_interval_ms", timing.status_interval_ms as i64)?
        .set_default(
            "timing.reconnect_probe_delay_ms",
            timing.reconnect_probe_delay_ms as i64,
        )?
        .set_default(
            "timing.connect_retry_delay_ms",
            timing.connect_retry_delay_ms as i64,
        )?
        .set_default(
            "timing.transport_retry_delay_ms",
            timing.transport_retry_delay_ms as i64,
        )?
        .set_default("timing.settle_delay_ms", timing.settle_delay_ms as i64)?
        .set_default("timing.lost_window_ms", timing.lost_window_ms as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        // Check platform-native config dir first, then fall back to
        // ~/.config/flared/ (install scripts use ~/.config/ even on macOS)
        let native_path = dirs::config_dir().map(|d| d.join("flared").join("config.toml"));
        let xdg_path =
            dirs::home_dir().map(|d| d.join(".config").join("flared").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(config::Environment::with_prefix("FLARED").separator("_"));

    let settings = builder.build()?;
    let config: NodeConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;

    #[test]
    fn test_node_config_default_has_expected_values() {
        let config = NodeConfig::default();

        assert_eq!(config.listen, "127.0.0.1:7710");
        assert_eq!(config.discovery_port, 7711);
        assert_eq!(config.max_alert_len, 500);
        assert_eq!(config.seen_capacity, 4096);
    }

    #[test]
    fn test_timing_defaults_match_engine_contract() {
        let timing = TimingConfig::default();

        assert_eq!(timing.discovery_start_delay_ms, 2_000);
        assert_eq!(timing.maintenance_interval_ms, 30_000);
        assert_eq!(timing.status_interval_ms, 10_000);
        assert_eq!(timing.reconnect_probe_delay_ms, 5_000);
        assert_eq!(timing.connect_retry_delay_ms, 3_000);
        assert_eq!(timing.transport_retry_delay_ms, 5_000);
        assert_eq!(timing.settle_delay_ms, 1_000);
        assert_eq!(timing.lost_window_ms, 120_000);
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(std::path::Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.listen, "127.0.0.1:7710");
        assert_eq!(config.timing.lost_window_ms, 120_000);
    }

    #[test]
    fn test_default_config_passes_validation() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_listen() {
        let mut config = NodeConfig::default();
        config.listen = String::new();
        assert!(config
            .validate()
            .unwrap_err()
            .contains("listen address must not be empty"));
    }

    #[test]
    fn test_validate_rejects_listen_without_port() {
        let mut config = NodeConfig::default();
        config.listen = "localhost".to_string();
        assert!(config.validate().unwrap_err().contains("host:port"));
    }

    #[test]
    fn test_validate_rejects_zero_discovery_port() {
        let mut config = NodeConfig::default();
        config.discovery_port = 0;
        assert!(config.validate().unwrap_err().contains("discovery_port"));
    }

    #[test]
    fn test_validate_rejects_overlong_name() {
        let mut config = NodeConfig::default();
        config.name = "x".repeat(65);
        assert!(config.validate().unwrap_err().contains("name"));
    }

    #[test]
    fn test_validate_rejects_zero_seen_capacity() {
        let mut config = NodeConfig::default();
        config.seen_capacity = 0;
        assert!(config.validate().unwrap_err().contains("seen_capacity"));
    }

    #[test]
    fn test_validate_rejects_zero_timing_field() {
        let mut config = NodeConfig::default();
        config.timing.settle_delay_ms = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("timing.settle_delay_ms"));
    }

    #[test]
    fn test_validate_rejects_lost_window_below_maintenance_interval() {
        let mut config = NodeConfig::default();
        config.timing.lost_window_ms = 1_000;
        assert!(config.validate().unwrap_err().contains("lost_window_ms"));
    }

    #[test]
    fn test_timing_accessors_convert_to_durations() {
        let timing = TimingConfig::default();
        assert_eq!(timing.discovery_start_delay(), Duration::from_secs(2));
        assert_eq!(timing.lost_window(), Duration::from_secs(120));
        assert_eq!(timing.settle_delay(), Duration::from_secs(1));
    }
}
