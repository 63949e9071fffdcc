//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::directv::DEFAULT_CLIENT_ADDR;
use crate::adapters::itach::IrLibrary;
use crate::adapters::wolfpack::MatrixSize;
use crate::adapters::{atlas, directv, itach, wolfpack, DriverSettings};
use crate::device::DriverKind;
use crate::transport::RetryPolicy;

/// Upper bound on simultaneous discovery probes
pub const MAX_CONCURRENCY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeouts: TimeoutConfig,
    pub discovery: DiscoveryConfig,
    pub retry: RetryPolicy,
    pub ports: PortConfig,
    pub matrix: MatrixSize,
    /// Preset name -> learned raw IR code
    pub ir_codes: HashMap<String, String>,
    pub satellite: SatelliteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub command_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5000,
            command_ms: 7000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub concurrency: usize,
    pub probe_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub multicast_window_ms: u64,
    pub multicast: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            probe_timeout_ms: 500,
            identify_timeout_ms: 3000,
            multicast_window_ms: 3000,
            multicast: true,
        }
    }
}

impl DiscoveryConfig {
    /// Configured concurrency, clamped to 1..=256.
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn multicast_window(&self) -> Duration {
        Duration::from_millis(self.multicast_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub gain: u16,
    pub satellite: u16,
    pub ir: u16,
    pub matrix: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            gain: atlas::DEFAULT_PORT,
            satellite: directv::DEFAULT_PORT,
            ir: itach::DEFAULT_PORT,
            matrix: wolfpack::DEFAULT_PORT,
        }
    }
}

impl PortConfig {
    pub fn for_kind(&self, kind: DriverKind) -> u16 {
        match kind {
            DriverKind::Gain => self.gain,
            DriverKind::Satellite => self.satellite,
            DriverKind::Ir => self.ir,
            DriverKind::Matrix => self.matrix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    pub client_addr: String,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            client_addr: DEFAULT_CLIENT_ADDR.to_string(),
        }
    }
}

impl Config {
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            command_timeout: Duration::from_millis(self.timeouts.command_ms),
            retry: self.retry,
            matrix: self.matrix,
            satellite_client_addr: self.satellite.client_addr.clone(),
        }
    }

    pub fn ir_library(&self) -> IrLibrary {
        IrLibrary::new(self.ir_codes.clone())
    }
}

/// Get config directory (AVC_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AVC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("venue-av-control");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/venue-av-control");
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_dir())
}

/// Defaults, then `config.{toml,json,yaml}` in `config_dir`, then `AVC_*`.
pub fn load_config_from(config_dir: &Path) -> Result<Config> {
    let config = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (AVC_TIMEOUTS__COMMAND_MS, AVC_MATRIX__INPUTS, etc.)
        .add_source(
            ::config::Environment::with_prefix("AVC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize()?;
    if config.discovery.concurrency != config.discovery.concurrency() {
        tracing::warn!(
            "discovery.concurrency {} clamped to {}",
            config.discovery.concurrency,
            config.discovery.concurrency()
        );
    }
    Ok(config)
}
