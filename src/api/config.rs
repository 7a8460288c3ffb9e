use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Settings for one driver instance.
///
/// Every field has a default, so a config file only needs to name what it
/// changes:
///
/// ```toml
/// port_name = "/dev/ttyUSB0"
///
/// [timings]
/// join_timeout_ms = 45000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Poll interval of the link reader thread.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    /// Threads that deliver socket data and device events.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Hex-dump every chunk crossing the link at trace level.
    #[serde(default)]
    pub trace_bytes: bool,
    #[serde(default)]
    pub timings: Timings,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    50
}

fn default_channel_count() -> usize {
    4
}

fn default_dispatch_workers() -> usize {
    2
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            channel_count: default_channel_count(),
            dispatch_workers: default_dispatch_workers(),
            trace_bytes: false,
            timings: Timings::default(),
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid TOML driver config")
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid JSON driver config")
    }

    /// Load a config file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(anyhow!(
                "unsupported config format {:?} for {}",
                other.unwrap_or(""),
                path.display()
            )),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.channel_count == 0 {
            return Err(anyhow!("channel_count must be at least 1"));
        }
        if self.dispatch_workers == 0 {
            return Err(anyhow!("dispatch_workers must be at least 1"));
        }
        Ok(())
    }
}

/// Every wait the driver performs, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub command_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub update_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub ping_backoff_ms: u64,
    pub ping_attempts: u32,
    pub power_settle_ms: u64,
    pub power_on_settle_ms: u64,
    pub open_attempts: u32,
    pub open_backoff_ms: u64,
    pub open_reply_timeout_ms: u64,
    pub discard_wait_ms: u64,
    pub reset_ready_timeout_ms: u64,
    pub reset_attempts: u32,
    pub wake_pulse_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            join_timeout_ms: 30_000,
            update_timeout_ms: 300_000,
            ping_timeout_ms: 1_000,
            ping_backoff_ms: 1_000,
            ping_attempts: 10,
            power_settle_ms: 2_000,
            power_on_settle_ms: 500,
            open_attempts: 3,
            open_backoff_ms: 500,
            open_reply_timeout_ms: 1_000,
            discard_wait_ms: 10_000,
            reset_ready_timeout_ms: 20_000,
            reset_attempts: 3,
            wake_pulse_ms: 3,
        }
    }
}

impl Timings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_backoff(&self) -> Duration {
        Duration::from_millis(self.ping_backoff_ms)
    }

    pub fn power_settle(&self) -> Duration {
        Duration::from_millis(self.power_settle_ms)
    }

    pub fn power_on_settle(&self) -> Duration {
        Duration::from_millis(self.power_on_settle_ms)
    }

    pub fn open_backoff(&self) -> Duration {
        Duration::from_millis(self.open_backoff_ms)
    }

    pub fn open_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.open_reply_timeout_ms)
    }

    pub fn discard_wait(&self) -> Duration {
        Duration::from_millis(self.discard_wait_ms)
    }

    pub fn reset_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_ready_timeout_ms)
    }

    pub fn wake_pulse(&self) -> Duration {
        Duration::from_millis(self.wake_pulse_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() -> Result<()> {
        let config = DriverConfig::from_toml_str("")?;
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.channel_count, 4);
        assert_eq!(config.timings.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.timings.update_timeout(), Duration::from_secs(300));
        Ok(())
    }

    #[test]
    fn test_partial_toml_overrides() -> Result<()> {
        let config = DriverConfig::from_toml_str(
            r#"
            port_name = "/dev/ttyUSB0"
            trace_bytes = true

            [timings]
            join_timeout_ms = 45000
            "#,
        )?;
        assert_eq!(config.port_name.as_deref(), Some("/dev/ttyUSB0"));
        assert!(config.trace_bytes);
        assert_eq!(config.timings.join_timeout_ms, 45_000);
        assert_eq!(config.timings.open_attempts, 3);
        Ok(())
    }

    #[test]
    fn test_json_config() -> Result<()> {
        let config = DriverConfig::from_json_str(
            r#"{ "baud_rate": 9600, "timings": { "open_backoff_ms": 250 } }"#,
        )?;
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timings.open_backoff(), Duration::from_millis(250));
        assert_eq!(config.dispatch_workers, 2);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_empty_pools() {
        let mut config = DriverConfig::default();
        assert!(config.validate().is_ok());
        config.channel_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_unknown_extension() {
        let path = std::env::temp_dir().join(format!("atlink-config-{}.ini", std::process::id()));
        std::fs::write(&path, "port_name = 1").unwrap();
        let result = DriverConfig::load(&path);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }
}
