//! Acquisition orchestrator.
//!
//! Runs one complete measurement against an open connection:
//!
//! ```text
//! Start → CheckReady → Configuring → Acquiring → Polling → Validating → Retrieving → Done
//!             │              │            │                                  │
//!             └──────────────┴────────────┴───────────── Aborted ◄───────────┘
//! ```
//!
//! Every step is a single blocking command on the [`CommandChannel`]; the
//! server cannot pipeline commands and applies them strictly in order. A
//! mandatory command that comes back empty aborts the run, because the
//! instrument's configuration would otherwise no longer match what the caller
//! asked for. Saturation above the threshold is advisory only.
//!
//! The connection is closed when the run ends, whichever way it ends.
//!
//! # Example
//!
//! ```no_run
//! use spectro_daq::acquisition::{AcquisitionConfig, Orchestrator, OrchestratorSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> spectro_daq::error::AppResult<()> {
//! let orchestrator = Orchestrator::connect(
//!     "127.0.0.1:1242",
//!     Duration::from_secs(10),
//!     OrchestratorSettings::default(),
//! )
//! .await?;
//! let report = orchestrator.run(AcquisitionConfig::default()).await?;
//! println!("{} points, saturated: {}", report.spectrum.len(), report.saturated);
//! # Ok(())
//! # }
//! ```

pub mod protocol;
pub mod settings;

pub use settings::{AcquisitionConfig, Apodization, Gain, UnknownSettingError};

use crate::channel::{Command, CommandChannel, Response, RetryPolicy, Timing};
use crate::error::{AppResult, ProtocolError, TransportError};
use crate::spectrum::Spectrum;
use crate::transport::{TcpTransport, Transport};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Saturation level above which a run is flagged.
pub const DEFAULT_SATURATION_THRESHOLD: f64 = 0.9;

/// States of a single acquisition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    /// Connected, nothing sent yet.
    Start,
    /// Identity and initialization status check.
    CheckReady,
    /// Sending transfer, gain, apodization and averaging settings.
    Configuring,
    /// Measurement started.
    Acquiring,
    /// Waiting for the remaining-measurement count to reach zero.
    Polling,
    /// Reading the detector saturation.
    Validating,
    /// Transferring the spectrum.
    Retrieving,
    /// Spectrum retrieved.
    Done,
    /// A mandatory step failed.
    Aborted,
}

impl AcquisitionState {
    /// Whether the run has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, AcquisitionState::Done | AcquisitionState::Aborted)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Start => "Start",
            AcquisitionState::CheckReady => "CheckReady",
            AcquisitionState::Configuring => "Configuring",
            AcquisitionState::Acquiring => "Acquiring",
            AcquisitionState::Polling => "Polling",
            AcquisitionState::Validating => "Validating",
            AcquisitionState::Retrieving => "Retrieving",
            AcquisitionState::Done => "Done",
            AcquisitionState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Timing and thresholds for an acquisition run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Timing for ordinary commands.
    pub timing: Timing,
    /// Idle timeout for the spectrum transfer, which can be large and slow.
    pub spectrum_timeout: Duration,
    /// Delay between `MEAS:REM?` polls.
    pub poll_interval: Duration,
    /// Stop polling after this many queries even if measurements remain.
    pub max_polls: Option<u32>,
    /// Saturation above this value flags the run.
    pub saturation_threshold: f64,
    /// Validation and retry policy for every command.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            spectrum_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            max_polls: None,
            saturation_threshold: DEFAULT_SATURATION_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a completed acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    /// `*IDN?` response of the instrument.
    pub identity: String,
    /// Parameters the spectrum was taken with.
    pub config: AcquisitionConfig,
    /// Parsed spectrum; may be empty if the transfer held no valid rows.
    pub spectrum: Spectrum,
    /// Saturation reading, if the server reported one.
    pub saturation: Option<f64>,
    /// Saturation exceeded the configured threshold.
    pub saturated: bool,
    /// Number of `MEAS:REM?` queries issued.
    pub polls: u32,
}

/// Drives one acquisition over a command channel.
///
/// [`run`](Orchestrator::run) consumes the orchestrator, so a connection
/// carries at most one acquisition.
pub struct Orchestrator<T: Transport> {
    channel: CommandChannel<T>,
    settings: OrchestratorSettings,
    state: AcquisitionState,
}

impl Orchestrator<TcpTransport> {
    /// Open a TCP connection to `address` and wrap it in an orchestrator.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the connection cannot be established.
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        settings: OrchestratorSettings,
    ) -> Result<Self, TransportError> {
        info!("Connecting to spectrometer at {}...", address);
        let transport = TcpTransport::open(address, connect_timeout).await?;
        info!("Connected.");
        Ok(Self::new(CommandChannel::new(transport), settings))
    }
}

impl<T: Transport> Orchestrator<T> {
    /// Wrap an existing channel.
    pub fn new(channel: CommandChannel<T>, settings: OrchestratorSettings) -> Self {
        Self {
            channel,
            settings,
            state: AcquisitionState::Start,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Run the full acquisition sequence and close the connection.
    ///
    /// # Errors
    /// - [`TransportError::NotConnected`] if the channel is not open.
    /// - [`ProtocolError::StillInitializing`] if the instrument has not
    ///   finished booting.
    /// - [`ProtocolError::NoResponse`] if a mandatory command got no valid
    ///   response.
    pub async fn run(mut self, config: AcquisitionConfig) -> AppResult<AcquisitionReport> {
        let span = info_span!("acquisition", run_id = %Uuid::new_v4());
        async move {
            let result = if self.channel.is_open() {
                self.sequence(config).await
            } else {
                Err(TransportError::NotConnected.into())
            };

            self.state = match &result {
                Ok(_) => AcquisitionState::Done,
                Err(e) => {
                    warn!("Acquisition aborted in {}: {}", self.state, e);
                    AcquisitionState::Aborted
                }
            };
            self.channel.close().await;
            info!("Connection closed.");
            result
        }
        .instrument(span)
        .await
    }

    fn transition(&mut self, next: AcquisitionState) {
        info!("{} → {}", self.state, next);
        self.state = next;
    }

    async fn query(&mut self, command: &Command) -> Response {
        self.channel
            .send(command, self.settings.timing, &self.settings.retry)
            .await
    }

    /// Send a command whose failure aborts the run.
    async fn require(&mut self, command: &Command) -> Result<Response, ProtocolError> {
        let response = self.query(command).await;
        if response.is_empty() {
            return Err(ProtocolError::NoResponse {
                step: self.state,
                command: command.to_string(),
            });
        }
        Ok(response)
    }

    async fn sequence(&mut self, config: AcquisitionConfig) -> AppResult<AcquisitionReport> {
        self.transition(AcquisitionState::CheckReady);
        let identity = self.require(&protocol::identify()).await?.into_string();
        let status = self.require(&protocol::init_status()).await?;
        if !protocol::status_reports_ready(status.text()) {
            warn!("Device is still initializing.");
            return Err(ProtocolError::StillInitializing {
                status: status.into_string(),
            }
            .into());
        }

        self.transition(AcquisitionState::Configuring);
        for command in protocol::configuration_commands(&config) {
            self.require(&command).await?;
        }

        self.transition(AcquisitionState::Acquiring);
        self.require(&protocol::begin_acquisition()).await?;

        self.transition(AcquisitionState::Polling);
        let polls = self.poll_until_complete().await;

        self.transition(AcquisitionState::Validating);
        let saturation = self.check_saturation().await;
        let saturated = saturation.is_some_and(|s| s > self.settings.saturation_threshold);

        self.transition(AcquisitionState::Retrieving);
        let spectrum = self.retrieve_spectrum().await?;

        Ok(AcquisitionReport {
            identity,
            config,
            spectrum,
            saturation,
            saturated,
            polls,
        })
    }

    /// Poll `MEAS:REM?` until it reports exactly zero.
    ///
    /// Stops early, with a warning, if the value cannot be read or the poll
    /// ceiling is reached, so a silent device cannot hold the run forever.
    async fn poll_until_complete(&mut self) -> u32 {
        let command = protocol::measurements_remaining();
        let mut polls = 0;

        loop {
            if self.settings.max_polls.is_some_and(|max| polls >= max) {
                warn!("Giving up on MEAS:REM? after {} polls", polls);
                break;
            }

            let response = self.query(&command).await;
            polls += 1;
            match protocol::extract_value_after_ok::<i64>(response.text()) {
                Some(0) => {
                    info!("Remaining measurements: 0");
                    break;
                }
                Some(remaining) => info!("Remaining measurements: {}", remaining),
                None => {
                    warn!("Couldn't parse MEAS:REM? response: {:?}", response.text());
                    break;
                }
            }

            sleep(self.settings.poll_interval).await;
        }

        polls
    }

    async fn check_saturation(&mut self) -> Option<f64> {
        let response = self.query(&protocol::saturation()).await;
        let saturation = protocol::extract_value_after_ok::<f64>(response.text());
        match saturation {
            Some(s) if s > self.settings.saturation_threshold => {
                warn!(
                    "Detector saturation detected ({:.3} > {:.3}).",
                    s, self.settings.saturation_threshold
                );
            }
            Some(s) => info!("Detector saturation: {:.3}", s),
            None => warn!("Couldn't parse SPEC:SAT? response: {:?}", response.text()),
        }
        saturation
    }

    async fn retrieve_spectrum(&mut self) -> Result<Spectrum, ProtocolError> {
        let command = protocol::fetch_spectrum();
        let timing = Timing {
            response_timeout: self.settings.spectrum_timeout,
            ..self.settings.timing
        };
        let response = self
            .channel
            .send(&command, timing, &self.settings.retry)
            .await;
        if response.is_empty() {
            return Err(ProtocolError::NoResponse {
                step: self.state,
                command: command.to_string(),
            });
        }

        let spectrum = Spectrum::parse(response.text());
        if spectrum.is_empty() {
            warn!("No valid spectrum data parsed.");
        } else {
            info!("Parsed spectrum with {} points.", spectrum.len());
        }
        Ok(spectrum)
    }
}
