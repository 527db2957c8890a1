//! Client configuration
//!
//! Loaded from `~/.config/bluelink/bluelink.yaml`. Every field has a default,
//! so a missing or partial file is fine:
//!
//! ```yaml
//! socket_dir: /var/run/bluealsa
//! interface: hci0
//! direction: capture
//! stream:
//!   period_ms: 20
//!   periods: 10
//! delay:
//!   refresh_ms: 250
//!   extra_frames: 0
//! reconnect_retry_ms: 100
//! ```

use bluelink_proto::StreamDirection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Directory holding one control socket per HCI interface
    pub socket_dir: PathBuf,
    /// HCI interface name, also the control socket file name
    pub interface: String,
    /// Stream direction requested from transports
    pub direction: StreamDirection,
    pub stream: StreamConfig,
    pub delay: DelayConfig,
    /// Wait before re-reading a byte channel whose writer is not ready yet
    pub reconnect_retry_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/var/run/bluealsa"),
            interface: "hci0".to_string(),
            direction: StreamDirection::Capture,
            stream: StreamConfig::default(),
            delay: DelayConfig::default(),
            reconnect_retry_ms: 100,
        }
    }
}

impl LinkConfig {
    /// Path of the daemon control socket for the configured interface
    pub fn control_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.interface)
    }

    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_ms)
    }
}

/// Ring buffer geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Period length in milliseconds
    pub period_ms: u32,
    /// Number of periods in the ring buffer
    pub periods: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            period_ms: 20,
            periods: 10,
        }
    }
}

impl StreamConfig {
    /// Period and buffer size in frames at the given sample rate
    pub fn frames_for(&self, rate: u32) -> (usize, usize) {
        let period = ((rate as u64 * self.period_ms as u64) / 1000).max(1) as usize;
        (period, period * self.periods as usize)
    }
}

/// Delay reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Minimum interval between codec delay queries to the daemon
    pub refresh_ms: u64,
    /// Extra frames added to every delay report
    pub extra_frames: usize,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 250,
            extra_frames: 0,
        }
    }
}

impl DelayConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

/// Default configuration file path
pub fn default_link_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bluelink")
        .join("bluelink.yaml")
}

/// Load configuration from a YAML file
///
/// Returns the default configuration if the file doesn't exist or fails to parse.
pub fn load_link_config(path: &Path) -> LinkConfig {
    log::info!("load_link_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_link_config: Config file doesn't exist, using defaults");
        return LinkConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<LinkConfig>(&contents) {
            Ok(config) => {
                log::info!(
                    "load_link_config: socket {:?}, direction {}, {}ms x {} periods",
                    config.control_socket_path(),
                    config.direction,
                    config.stream.period_ms,
                    config.stream.periods
                );
                config
            }
            Err(e) => {
                log::warn!("load_link_config: Failed to parse config: {}", e);
                LinkConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_link_config: Failed to read config file: {}", e);
            LinkConfig::default()
        }
    }
}

/// Save configuration to a YAML file
///
/// Creates the parent directory if needed.
pub fn save_link_config(config: &LinkConfig, path: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    log::info!("save_link_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize link config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write link config file: {:?}", path))?;

    log::info!("save_link_config: Config saved successfully");
    Ok(())
}
