//! Acquisition client and calibration pipeline for a TCP-controlled FTIR
//! spectrometer server.
//!
//! The crate is layered bottom-up:
//!
//! - [`transport`]: raw line I/O over TCP (plus a scripted mock)
//! - [`channel`]: command/response framing, validation and retries
//! - [`readiness`]: waiting for a freshly launched server to finish booting
//! - [`acquisition`]: the configure → acquire → poll → retrieve state machine
//! - [`spectrum`]: parsing the transferred spectrum and its CSV format
//! - [`calibration`]: interpolation, SNV and the linear prediction model
//!
//! Around the core, [`process`] manages the server executable, `upload` talks
//! to the web backend, and [`session`] runs the whole pipeline from a
//! [`config::Settings`].

pub mod acquisition;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod readiness;
pub mod session;
pub mod spectrum;
pub mod transport;
#[cfg(feature = "upload")]
pub mod upload;

pub use error::{AppResult, SpectroError};
