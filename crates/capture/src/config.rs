//! Capture configuration management

use crate::ring_buffer::DEFAULT_RING_CAPACITY;
use crate::usb::{PumpSettings, TransferSettings};
use anyhow::{Context, Result, anyhow};
use common::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Vendor id of the supported capture device
pub const DEFAULT_VENDOR_ID: u16 = 0x1733;
/// Product id of the supported capture device
pub const DEFAULT_PRODUCT_ID: u16 = 0xAABB;
/// Interrupt IN endpoint the device streams on
pub const DEFAULT_ENDPOINT: u8 = 0x81;
pub const DEFAULT_TRANSFER_SIZE: usize = 64;
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Device selection and transfer shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns, e.g. `0x1733:0xAABB` or `0x1733:*`
    #[serde(default = "UsbSettings::default_filters")]
    pub filters: Vec<String>,
    #[serde(default = "UsbSettings::default_endpoint")]
    pub endpoint: u8,
    #[serde(default)]
    pub interface: u8,
    #[serde(default = "UsbSettings::default_transfer_size")]
    pub transfer_size: usize,
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Self::default_filters(),
            endpoint: Self::default_endpoint(),
            interface: 0,
            transfer_size: Self::default_transfer_size(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_filters() -> Vec<String> {
        vec![DeviceFilter::exact(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).to_string()]
    }

    fn default_endpoint() -> u8 {
        DEFAULT_ENDPOINT
    }

    fn default_transfer_size() -> usize {
        DEFAULT_TRANSFER_SIZE
    }

    fn default_transfer_timeout_ms() -> u64 {
        DEFAULT_TRANSFER_TIMEOUT_MS
    }
}

/// Buffering and event pump timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Ring buffer capacity per session, in bytes
    #[serde(default = "CaptureSettings::default_ring_capacity")]
    pub ring_capacity: usize,
    /// Upper bound for each pump_events call
    #[serde(default = "CaptureSettings::default_poll_timeout_us")]
    pub poll_timeout_us: u64,
    /// Pause between event pump iterations
    #[serde(default = "CaptureSettings::default_idle_yield_us")]
    pub idle_yield_us: u64,
    /// Bound on waiting for a cancellation acknowledgment (defaults to the
    /// transfer timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_timeout_ms: Option<u64>,
    #[serde(default = "CaptureSettings::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Upper bound on devices returned by a scan
    #[serde(default = "CaptureSettings::default_max_scan")]
    pub max_scan: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ring_capacity: Self::default_ring_capacity(),
            poll_timeout_us: Self::default_poll_timeout_us(),
            idle_yield_us: Self::default_idle_yield_us(),
            close_timeout_ms: None,
            shutdown_timeout_ms: Self::default_shutdown_timeout_ms(),
            max_scan: Self::default_max_scan(),
        }
    }
}

impl CaptureSettings {
    fn default_ring_capacity() -> usize {
        DEFAULT_RING_CAPACITY
    }

    fn default_poll_timeout_us() -> u64 {
        1000
    }

    fn default_idle_yield_us() -> u64 {
        1000
    }

    fn default_shutdown_timeout_ms() -> u64 {
        1000
    }

    fn default_max_scan() -> usize {
        16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-capture/capture.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-capture").join("capture.toml")
        } else {
            PathBuf::from(".config/usb-capture/capture.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        self.device_filters()?;

        if self.usb.endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Endpoint {:#04x} is not an IN endpoint (bit 7 must be set)",
                self.usb.endpoint
            ));
        }
        if self.usb.transfer_size == 0 {
            return Err(anyhow!("transfer_size must be greater than zero"));
        }
        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than zero"));
        }
        if self.capture.ring_capacity == 0 {
            return Err(anyhow!("ring_capacity must be greater than zero"));
        }
        if self.capture.close_timeout_ms == Some(0) {
            return Err(anyhow!("close_timeout_ms must be greater than zero"));
        }
        if self.capture.shutdown_timeout_ms == 0 {
            return Err(anyhow!("shutdown_timeout_ms must be greater than zero"));
        }

        Ok(())
    }

    /// Parse the configured VID:PID patterns
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.usb
            .filters
            .iter()
            .map(|f| {
                f.parse::<DeviceFilter>()
                    .with_context(|| format!("Invalid device filter '{}'", f))
            })
            .collect()
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            endpoint: self.usb.endpoint,
            transfer_size: self.usb.transfer_size,
            timeout: Duration::from_millis(self.usb.transfer_timeout_ms),
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            poll_timeout: Duration::from_micros(self.capture.poll_timeout_us),
            idle_yield: Duration::from_micros(self.capture.idle_yield_us),
            shutdown_timeout: Duration::from_millis(self.capture.shutdown_timeout_ms),
        }
    }

    /// How long close waits for a cancellation acknowledgment
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(
            self.capture
                .close_timeout_ms
                .unwrap_or(self.usb.transfer_timeout_ms),
        )
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<CaptureConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    CaptureConfig::load(Some(path_buf))
}
