//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file, `config/default.toml` unless another path is given
//! 3. Environment variables prefixed with `SPECTRO_`, sections separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SPECTRO_APPLICATION__LOG_LEVEL=debug
//! SPECTRO_INSTRUMENT__HOST=192.168.1.40
//! SPECTRO_ACQUISITION__AVERAGE_COUNT=16
//! SPECTRO_UPLOAD__SPECTRUM_URL=http://backend:8000/api/spectra/
//! ```
//!
//! Durations are stored as integer milliseconds (`*_ms`) and converted by the
//! accessor methods on [`Settings`].
//!
//! # Example
//!
//! ```no_run
//! use spectro_daq::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("Instrument: {}", settings.address());
//!     println!("Log level: {}", settings.application.log_level);
//!     Ok(())
//! }
//! ```

use crate::acquisition::{AcquisitionConfig, Apodization, Gain, OrchestratorSettings};
use crate::calibration::DEFAULT_OUTPUT_SCALE;
use crate::channel::{RetryPolicy, Timing, ACK_TOKEN, IDENTITY_MARKER};
use crate::logging::LogFormat;
use crate::readiness::ReadinessSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "SPECTRO_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name, logging and output directory
    pub application: ApplicationSettings,
    /// Server address and command timing
    pub instrument: InstrumentSettings,
    /// Readiness probing
    pub readiness: ReadinessConfig,
    /// Acquisition parameters
    pub acquisition: AcquisitionSettings,
    /// Calibration table
    pub calibration: CalibrationSettings,
    /// HTTP upload endpoints
    pub upload: UploadSettings,
    /// Server executable
    pub process: ProcessSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (text, json)
    pub log_format: String,
    /// Directory where spectrum CSV files are written
    pub output_dir: PathBuf,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "spectro-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

/// Connection and command timing for the spectrometer server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// Server host name or IP address
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// TCP connect timeout for the acquisition connection
    pub connect_timeout_ms: u64,
    /// Settling delay between a command and reading its reply
    pub command_delay_ms: u64,
    /// Idle gap that ends an ordinary response
    pub response_timeout_ms: u64,
    /// Idle gap that ends the spectrum transfer
    pub spectrum_timeout_ms: u64,
    /// Attempts per command, including the first
    pub retry_attempts: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
    /// A response must contain one of these to be accepted
    pub accepted_tokens: Vec<String>,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1242,
            connect_timeout_ms: 10_000,
            command_delay_ms: 500,
            response_timeout_ms: 5_000,
            spectrum_timeout_ms: 300_000,
            retry_attempts: 5,
            retry_delay_ms: 1_000,
            accepted_tokens: vec![ACK_TOKEN.to_string(), IDENTITY_MARKER.to_string()],
        }
    }
}

/// Readiness probing before an acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Probe the server before connecting for the acquisition
    pub enabled: bool,
    /// Give up after this long
    pub max_wait_ms: u64,
    /// Pause between probes
    pub poll_interval_ms: u64,
    /// TCP connect timeout per probe
    pub connect_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_wait_ms: 30_000,
            poll_interval_ms: 2_000,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Acquisition parameters and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Detector gain
    pub gain: Gain,
    /// Apodization function
    pub apodization: Apodization,
    /// Spectra averaged per measurement (must be > 0)
    pub average_count: u32,
    /// Also average interferograms (`IFGM:AVG`)
    pub interferogram_averaging: bool,
    /// Saturation reading above which the run is flagged
    pub saturation_threshold: f64,
    /// Pause between `MEAS:REM?` queries
    pub poll_interval_ms: u64,
    /// Upper bound on `MEAS:REM?` queries; unbounded when absent
    pub max_polls: Option<u32>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        let config = AcquisitionConfig::default();
        Self {
            gain: config.gain,
            apodization: config.apodization,
            average_count: config.average_count.get(),
            interferogram_averaging: config.interferogram_averaging,
            saturation_threshold: crate::acquisition::DEFAULT_SATURATION_THRESHOLD,
            poll_interval_ms: 1_000,
            max_polls: None,
        }
    }
}

/// Calibration table location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Headerless `wavelength,coefficient,constant` CSV; no prediction when absent
    pub path: Option<PathBuf>,
    /// Factor applied to the linear model output
    pub output_scale: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            path: None,
            output_scale: DEFAULT_OUTPUT_SCALE,
        }
    }
}

/// Upstream HTTP endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Endpoint receiving spectra
    pub spectrum_url: Option<String>,
    /// Endpoint receiving predictions
    pub prediction_url: Option<String>,
    /// First component of the device tag
    pub device_prefix: String,
    /// Free-text operator note appended to the device tag
    pub message: String,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            spectrum_url: None,
            prediction_url: None,
            device_prefix: "SPECTRO".to_string(),
            message: String::new(),
            timeout_ms: 30_000,
        }
    }
}

impl UploadSettings {
    /// Uploading runs only when both endpoints are configured.
    pub fn is_enabled(&self) -> bool {
        self.spectrum_url.is_some() && self.prediction_url.is_some()
    }
}

/// Spectrometer server executable launched by the session runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Not launched when absent; the server is assumed to be running already
    pub executable: Option<PathBuf>,
    /// Command-line arguments for the executable
    pub args: Vec<String>,
    /// Time between the terminate request and a forced kill
    pub shutdown_grace_ms: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is invalid or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if LogFormat::from_name(&self.application.log_format).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: text, json",
                self.application.log_format
            )));
        }

        if self.instrument.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.host cannot be empty".to_string(),
            ));
        }
        if self.instrument.port == 0 {
            return Err(ConfigError::ValidationError(
                "instrument.port must be > 0".to_string(),
            ));
        }
        if self.instrument.retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "instrument.retry_attempts must be >= 1".to_string(),
            ));
        }
        if self.instrument.accepted_tokens.is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument.accepted_tokens cannot be empty".to_string(),
            ));
        }

        if self.acquisition.average_count == 0 {
            return Err(ConfigError::ValidationError(
                "acquisition.average_count must be > 0".to_string(),
            ));
        }
        let threshold = self.acquisition.saturation_threshold;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid acquisition.saturation_threshold {}. Must be a positive number",
                threshold
            )));
        }

        if !self.calibration.output_scale.is_finite() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid calibration.output_scale {}",
                self.calibration.output_scale
            )));
        }

        for (name, url) in [
            ("spectrum_url", &self.upload.spectrum_url),
            ("prediction_url", &self.upload.prediction_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::ValidationError(format!(
                        "upload.{} must be an http(s) URL, got '{}'",
                        name, url
                    )));
                }
            }
        }

        Ok(())
    }

    /// Configured log format; text if unrecognized.
    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_name(&self.application.log_format).unwrap_or_default()
    }

    /// `host:port` of the spectrometer server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.instrument.host, self.instrument.port)
    }

    /// Connect timeout for the acquisition connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.instrument.connect_timeout_ms)
    }

    /// Per-command timing.
    pub fn timing(&self) -> Timing {
        Timing {
            response_timeout: Duration::from_millis(self.instrument.response_timeout_ms),
            post_send_delay: Duration::from_millis(self.instrument.command_delay_ms),
        }
    }

    /// Validation and retry policy for orchestrated commands.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::validated(
            self.instrument.retry_attempts,
            Duration::from_millis(self.instrument.retry_delay_ms),
            self.instrument.accepted_tokens.iter().cloned(),
        )
    }

    /// Timing, retry and polling settings for the acquisition orchestrator.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            timing: self.timing(),
            spectrum_timeout: Duration::from_millis(self.instrument.spectrum_timeout_ms),
            poll_interval: Duration::from_millis(self.acquisition.poll_interval_ms),
            max_polls: self.acquisition.max_polls,
            saturation_threshold: self.acquisition.saturation_threshold,
            retry: self.retry_policy(),
        }
    }

    /// Probe settings for the readiness supervisor.
    pub fn readiness_settings(&self) -> ReadinessSettings {
        ReadinessSettings {
            connect_timeout: Duration::from_millis(self.readiness.connect_timeout_ms),
            poll_interval: Duration::from_millis(self.readiness.poll_interval_ms),
            timing: self.timing(),
        }
    }

    /// Total time the readiness probe may take.
    pub fn readiness_max_wait(&self) -> Duration {
        Duration::from_millis(self.readiness.max_wait_ms)
    }

    /// Acquisition parameters for one run.
    ///
    /// # Errors
    ///
    /// Returns a ValidationError if `average_count` is zero.
    pub fn acquisition_config(&self) -> Result<AcquisitionConfig, ConfigError> {
        let average_count = NonZeroU32::new(self.acquisition.average_count).ok_or_else(|| {
            ConfigError::ValidationError("acquisition.average_count must be > 0".to_string())
        })?;
        Ok(AcquisitionConfig {
            gain: self.acquisition.gain,
            apodization: self.acquisition.apodization,
            average_count,
            interferogram_averaging: self.acquisition.interferogram_averaging,
        })
    }

    /// Grace period between terminate and kill for the server process.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.process.shutdown_grace_ms)
    }
}
