//! Runner configuration using Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (the values the instrument ships with)
//! 2. A TOML file (`config/runner.toml` unless another path is given)
//! 3. Environment variables prefixed with `PCR_RUNNER_`, using `__` between
//!    nesting levels
//!
//! # Environment Variable Overrides
//!
//! ```text
//! PCR_RUNNER_SERVER__PORT=50000
//! PCR_RUNNER_LOGGING__LEVEL=debug
//! PCR_RUNNER_CAMERA__EXPOSURE_SETTLE_MS=1500
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pcr_runner::config::RunnerConfig;
//!
//! let config = RunnerConfig::load_from("config/runner.toml")?;
//! println!("listening on {}:{}", config.server.host, config.server.port);
//! # Ok::<(), pcr_runner::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error_recovery::RetryPolicy;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/runner.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PCR_RUNNER_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level runner configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// TCP command server
    pub server: ServerConfig,
    /// Instrument identity and record storage
    pub instrument: InstrumentConfig,
    /// Controller link
    pub serial: SerialConfig,
    /// Camera acquisition parameters
    pub camera: CameraConfig,
    /// Crop rectangle relative to the controller's reference position
    pub roi: RoiConfig,
    /// Intensity mask resource
    pub mask: MaskConfig,
    /// Simulated hardware used with `--emulate`
    pub emulator: EmulatorConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// TCP command server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address; the client runs on the same machine.
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 48888,
        }
    }
}

/// Instrument identity configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Prepended to the 5-character serial number to form the instrument id.
    pub id_prefix: String,
    /// Root directory for captured frames and logs.
    pub record_dir: PathBuf,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            id_prefix: "HelloPCR".to_string(),
            record_dir: PathBuf::from("Record"),
        }
    }
}

impl InstrumentConfig {
    /// Full instrument id for a serial number, e.g. `HelloPCR00123`.
    pub fn instrument_id(&self, serial_number: &str) -> String {
        format!("{}{}", self.id_prefix, serial_number)
    }

    /// Directory holding everything recorded for one instrument.
    pub fn instrument_dir(&self, instrument_id: &str) -> PathBuf {
        self.record_dir.join(instrument_id)
    }
}

/// Controller link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// USB vendor id of the controller board
    pub vendor_id: u16,
    /// USB product id of the controller board
    pub product_id: u16,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-line read timeout in milliseconds
    pub timeout_ms: u64,
    /// Extra attempts after a failed write or read
    pub retries: u32,
    /// Delay between attempts in milliseconds
    pub retry_backoff_ms: u64,
    /// Excitation LED PWM applied at bring-up
    pub led_pwm: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x239A,
            product_id: 0x801E,
            baud_rate: 9600,
            timeout_ms: 1000,
            retries: 3,
            retry_backoff_ms: 0,
            led_pwm: 250,
        }
    }
}

impl SerialConfig {
    /// Read timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retry policy for link writes and reads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff_delay: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Camera acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Focus value applied before every shot
    pub focus: i32,
    /// Attempts for the focus write
    pub focus_retries: u32,
    /// Time between LED-on and frame grab, in milliseconds
    pub exposure_settle_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            focus: 1023,
            focus_retries: 5,
            exposure_settle_ms: 2000,
        }
    }
}

impl CameraConfig {
    /// Exposure settle time as a `Duration`.
    pub fn exposure_settle(&self) -> Duration {
        Duration::from_millis(self.exposure_settle_ms)
    }
}

/// Crop rectangle configuration.
///
/// The crop origin is `(reference_y - dy, reference_x - dx)` where the
/// reference position is queried from the controller at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// Horizontal distance from the reference position to the crop's left edge
    pub dx: i32,
    /// Vertical distance from the reference position to the crop's top edge
    pub dy: i32,
    /// Crop width in pixels
    pub width: u32,
    /// Crop height in pixels
    pub height: u32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            dx: 325,
            dy: 132,
            width: 420,
            height: 560,
        }
    }
}

/// Mask resource configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// 8-bit grayscale PNG, 255 marks a selected pixel
    pub path: PathBuf,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mask.png"),
        }
    }
}

/// Simulated hardware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Time an emulated shot takes, in milliseconds
    pub shot_delay_ms: u64,
    /// Reference position reported by the simulated controller
    pub reference_x: i32,
    /// Reference position reported by the simulated controller
    pub reference_y: i32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            shot_delay_ms: 1000,
            reference_x: 1000,
            reference_y: 600,
        }
    }
}

impl EmulatorConfig {
    /// Shot delay as a `Duration`.
    pub fn shot_delay(&self) -> Duration {
        Duration::from_millis(self.shot_delay_ms)
    }
}

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Also append to `<record_dir>/<instrument_id>/Log/runner-YYYYMMDD.log`
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: true,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RunnerConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(RunnerConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be > 0".to_string(),
            ));
        }

        if self.instrument.id_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.id_prefix cannot be empty".to_string(),
            ));
        }

        if self.roi.width == 0 || self.roi.height == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ROI size {}x{}",
                self.roi.width, self.roi.height
            )));
        }

        if self.serial.retries > 16 {
            return Err(ConfigError::ValidationError(format!(
                "serial.retries {} is too large (max 16)",
                self.serial.retries
            )));
        }

        if self.camera.focus_retries == 0 {
            return Err(ConfigError::ValidationError(
                "camera.focus_retries must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
