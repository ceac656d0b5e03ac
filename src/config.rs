//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/hcsr04.toml` (base configuration)
//! 2. Environment variables prefixed with `HCSR04_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use hcsr04_daq::config::SonarConfig;
//!
//! let config = SonarConfig::load()?;
//! println!("Timeout: {} ms", config.measurement.timeout_ms);
//! # Ok::<(), hcsr04_daq::error::SonarError>(())
//! ```
//!
//! Override the echo deadline without touching the file:
//! `HCSR04_MEASUREMENT__TIMEOUT_MS=250`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::engine;
use crate::error::{Result, SonarError};
use crate::registry;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/hcsr04.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HCSR04_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SonarConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Measurement timing
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// Device pool settings
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Pin backend
    #[serde(default)]
    pub backend: Backend,
    /// Sensors to attach at startup
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "hcsr04".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Measurement timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Echo deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Trigger pulse width in microseconds (10-20)
    #[serde(default = "default_pulse_width_us")]
    pub pulse_width_us: u64,
}

impl MeasurementConfig {
    /// Echo deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Trigger pulse width.
    pub fn pulse_width(&self) -> Duration {
        Duration::from_micros(self.pulse_width_us)
    }
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            pulse_width_us: default_pulse_width_us(),
        }
    }
}

/// Device pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Number of slots
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Major device number
    #[serde(default = "default_major")]
    pub major: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            major: default_major(),
        }
    }
}

/// Pin backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated sensors
    #[default]
    Simulated,
    /// Raspberry Pi GPIO (requires the `rpi` feature)
    Rpi,
}

/// One sensor definition.
///
/// Everything but `node` is optional so that an incomplete definition is
/// reported as an attach failure for that sensor rather than a load failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Physical handle (unique)
    pub node: String,
    /// Label
    #[serde(default)]
    pub label: Option<String>,
    /// BCM pin number of the echo line
    #[serde(default)]
    pub echo_gpio: Option<u8>,
    /// BCM pin number of the trigger line
    #[serde(default)]
    pub trigger_gpio: Option<u8>,
    /// Whether to attach at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_log_format() -> String {
    "compact".to_string()
}

fn default_timeout_ms() -> u64 {
    engine::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_pulse_width_us() -> u64 {
    engine::DEFAULT_PULSE_WIDTH.as_micros() as u64
}

fn default_capacity() -> usize {
    registry::DEFAULT_CAPACITY
}

fn default_major() -> u32 {
    registry::DEFAULT_MAJOR
}

fn default_enabled() -> bool {
    true
}

impl SonarConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SonarError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(SonarError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.measurement.timeout_ms == 0 {
            return Err(SonarError::Configuration(
                "measurement.timeout_ms must be greater than 0".to_string(),
            ));
        }

        let width = self.measurement.pulse_width();
        if !(engine::MIN_PULSE_WIDTH..=engine::MAX_PULSE_WIDTH).contains(&width) {
            return Err(SonarError::Configuration(format!(
                "Invalid pulse_width_us {}. Must be {}-{}",
                self.measurement.pulse_width_us,
                engine::MIN_PULSE_WIDTH.as_micros(),
                engine::MAX_PULSE_WIDTH.as_micros()
            )));
        }

        if self.registry.capacity == 0 {
            return Err(SonarError::Configuration(
                "registry.capacity must be greater than 0".to_string(),
            ));
        }

        let mut nodes = HashSet::new();
        for device in &self.devices {
            if !nodes.insert(device.node.as_str()) {
                return Err(SonarError::Configuration(format!(
                    "Duplicate device node: {}",
                    device.node
                )));
            }
        }

        let enabled = self.enabled_devices().len();
        if enabled > self.registry.capacity {
            return Err(SonarError::Configuration(format!(
                "{enabled} enabled devices exceed registry capacity {}",
                self.registry.capacity
            )));
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }
}
