//! Custom error types for the application.
//!
//! This module defines the primary error type, `SpectroError`, together with the
//! layer-specific errors it aggregates. Using the `thiserror` crate, it provides a
//! centralized and consistent way to handle the failures that can occur between
//! the socket and the final prediction.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: connection refused, reset or timed out. The readiness loop
//!   treats these as "not reachable yet"; inside an acquisition they are fatal.
//! - **`Protocol`**: the instrument did not give a usable answer to a mandatory
//!   command, or reported that it is still initializing. Aborts the current run.
//! - **`Calibration`**: missing or empty calibration table, or an empty spectrum.
//!   Fatal to the prediction step only; the captured spectrum stays valid.
//! - **`Config`**: loading or validating the settings failed.
//! - **`Io`** / **`Csv`**: file access while writing or reading spectrum tables.
//!
//! Malformed spectrum lines are never surfaced as errors: the parser skips them.
//! Detector saturation is advisory and is reported on the acquisition report,
//! not through this type.

use crate::acquisition::AcquisitionState;
use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SpectroError>;

/// Top-level error for the acquisition and calibration pipeline.
#[derive(Error, Debug)]
pub enum SpectroError {
    /// Settings could not be loaded or are invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The acquisition run was aborted.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Prediction failed.
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Spectrum CSV could not be written or read.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Command text contains a line break or is empty.
    #[error("Invalid command line {0:?}: commands must be a single line")]
    InvalidCommand(String),

    /// The readiness wait ran out.
    #[error("Instrument at {address} not ready after {waited:?}")]
    NotReady {
        /// Server address
        address: String,
        /// How long readiness was awaited
        waited: Duration,
    },

    /// The server executable could not be launched.
    #[error("Failed to start instrument process '{executable}': {source}")]
    ProcessSpawn {
        /// Path of the executable
        executable: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be built.
    #[error("Upload client error: {0}")]
    Upload(String),

    /// The session was interrupted before it finished.
    #[error("Session cancelled")]
    Cancelled,
}

/// Failures of the raw byte stream to the instrument.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection refused or reset.
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        /// Server address
        address: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// No connection within the connect timeout.
    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Server address
        address: String,
        /// Connect timeout that elapsed
        timeout: Duration,
    },

    /// Used after close.
    #[error("Transport not connected")]
    NotConnected,

    /// Read or write failed on an open connection.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons an acquisition run was aborted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// `STAT:INIT?` did not report completion.
    #[error("instrument is still initializing (status response: {status:?})")]
    StillInitializing {
        /// Raw status response
        status: String,
    },

    /// A mandatory command exhausted its retries.
    #[error("no valid response to '{command}' during {step}")]
    NoResponse {
        /// Step that was running
        step: AcquisitionState,
        /// Command that went unanswered
        command: String,
    },
}

impl ProtocolError {
    /// The orchestrator state in which the run was aborted.
    pub fn step(&self) -> AcquisitionState {
        match self {
            ProtocolError::StillInitializing { .. } => AcquisitionState::CheckReady,
            ProtocolError::NoResponse { step, .. } => *step,
        }
    }
}

/// Failures of the calibration step.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// No spectral points to calibrate.
    #[error("Spectrum is empty")]
    EmptySpectrum,

    /// No row carries a coefficient.
    #[error("Calibration table has no coefficient rows")]
    EmptyTable,

    /// No row carries a constant.
    #[error("Calibration table has no constant term")]
    MissingConstant,

    /// Wavelength and coefficient columns differ in length.
    #[error("Calibration table has {wavelengths} wavelengths but {coefficients} coefficients")]
    LengthMismatch {
        /// Number of wavelengths
        wavelengths: usize,
        /// Number of coefficients
        coefficients: usize,
    },

    /// A cell could not be parsed.
    #[error("Calibration table line {line}: {message}")]
    Malformed {
        /// 1-based line in the table file
        line: u64,
        /// What was wrong
        message: String,
    },

    /// The table file could not be read.
    #[error("Failed to read calibration table: {0}")]
    Csv(#[from] csv::Error),
}
