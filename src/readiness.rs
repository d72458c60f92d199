//! Readiness supervision for a freshly launched spectrometer server.
//!
//! The server process needs a while after launch before it accepts
//! connections, and longer still before its hardware initialization finishes.
//! [`ReadinessSupervisor::wait_until_ready`] probes it on a fixed cadence with
//! a brand-new connection per attempt:
//!
//! 1. connect (refusal or timeout just means "not up yet")
//! 2. `*IDN?` must mention the server's identity marker
//! 3. `STAT:INIT?` must report `0`
//!
//! Probe commands are sent once, without validation retries; the polling loop
//! is the retry. The probe connection is always closed before the next
//! attempt, so the acquisition later gets a clean session.

use crate::acquisition::protocol;
use crate::channel::{CommandChannel, RetryPolicy, Timing, IDENTITY_MARKER};
use crate::transport::{Connector, TcpConnector};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, Instrument};

/// Timing for readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessSettings {
    /// Connect timeout for each probe connection.
    pub connect_timeout: Duration,
    /// Delay between probes.
    pub poll_interval: Duration,
    /// Timing for the probe commands.
    pub timing: Timing,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            timing: Timing::default(),
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Probe {
    Ready,
    Unreachable,
    WrongIdentity(String),
    Initializing(String),
}

/// Polls a server until it reports initialization complete.
pub struct ReadinessSupervisor<C: Connector> {
    connector: C,
    settings: ReadinessSettings,
}

impl<C: Connector> ReadinessSupervisor<C> {
    /// Create a supervisor that opens probe connections through `connector`.
    pub fn new(connector: C, settings: ReadinessSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Probe until the server is ready or `max_wait` has elapsed.
    ///
    /// At least one probe is always made. Returns `false` only when the wait
    /// is exhausted.
    pub async fn wait_until_ready(&self, max_wait: Duration) -> bool {
        let span = info_span!("readiness", address = %self.connector.address());
        async move {
            info!("Waiting up to {:?} for spectrometer to be ready...", max_wait);
            let start = Instant::now();
            let mut attempt = 0u32;

            loop {
                attempt += 1;
                match self.probe().await {
                    Probe::Ready => {
                        info!(
                            "Spectrometer ready after {} attempt(s) ({:?})",
                            attempt,
                            start.elapsed()
                        );
                        return true;
                    }
                    Probe::Unreachable => {}
                    Probe::WrongIdentity(text) => {
                        info!("Unexpected identity response: {:?}", text)
                    }
                    Probe::Initializing(text) => {
                        info!("Spectrometer still initializing: {:?}", text)
                    }
                }

                let elapsed = start.elapsed();
                if elapsed >= max_wait {
                    error!(
                        "Spectrometer did not become ready within {:?} ({} attempts)",
                        max_wait, attempt
                    );
                    return false;
                }
                sleep(self.settings.poll_interval.min(max_wait - elapsed)).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn probe(&self) -> Probe {
        let transport = match self.connector.connect(self.settings.connect_timeout).await {
            Ok(transport) => transport,
            Err(e) => {
                info!("Spectrometer not reachable yet: {}", e);
                return Probe::Unreachable;
            }
        };

        let mut channel = CommandChannel::new(transport);
        let outcome = self.query(&mut channel).await;
        channel.close().await;
        debug!("Probe connection closed");
        outcome
    }

    async fn query(&self, channel: &mut CommandChannel<C::Transport>) -> Probe {
        let policy = RetryPolicy::unvalidated(1, Duration::ZERO);
        let timing = self.settings.timing;

        let identity = channel.send(&protocol::identify(), timing, &policy).await;
        if !identity.text().contains(IDENTITY_MARKER) {
            return Probe::WrongIdentity(identity.into_string());
        }

        let status = channel.send(&protocol::init_status(), timing, &policy).await;
        if protocol::status_reports_ready(status.text()) {
            Probe::Ready
        } else {
            Probe::Initializing(status.into_string())
        }
    }
}

/// Wait for the server at `address` using plain TCP probes.
pub async fn wait_until_ready(address: &str, max_wait: Duration, settings: ReadinessSettings) -> bool {
    ReadinessSupervisor::new(TcpConnector::new(address), settings)
        .wait_until_ready(max_wait)
        .await
}
