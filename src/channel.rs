//! Command/response channel over a [`Transport`].
//!
//! The spectrometer protocol has no length prefix and no terminator byte on
//! responses: the end of a message is inferred from silence. A command is
//! written, the channel waits a short settling delay (the server drops bytes if
//! a reply is read too eagerly), then accumulates everything that arrives until
//! the stream has been idle for the response timeout.
//!
//! Validation and retries are described by a [`RetryPolicy`]. When every
//! attempt fails the channel returns an empty [`Response`] rather than an
//! error; callers decide whether that is fatal at their own layer.

use crate::error::SpectroError;
use crate::transport::Transport;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Responses longer than this are logged as a length summary only.
pub const LOG_ELISION_THRESHOLD: usize = 200;

/// Acknowledgement token included in every accepted response.
pub const ACK_TOKEN: &str = "OK";

/// Substring of the `*IDN?` reply that identifies the spectrometer server.
pub const IDENTITY_MARKER: &str = "ARCspectro";

/// A single ASCII command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    /// Create a command, rejecting embedded line breaks.
    ///
    /// # Errors
    /// Returns [`SpectroError::InvalidCommand`] if `line` contains `\n` or `\r`.
    pub fn new(line: impl Into<String>) -> Result<Self, SpectroError> {
        let line = line.into();
        if line.contains(['\n', '\r']) {
            return Err(SpectroError::InvalidCommand(line));
        }
        Ok(Self(line))
    }

    /// Commands built from the fixed protocol table.
    pub(crate) fn trusted(line: String) -> Self {
        debug_assert!(!line.contains(['\n', '\r']));
        Self(line)
    }

    /// The command text without terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded response text, trimmed of surrounding whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response(String);

impl Response {
    /// Wrap already-decoded response text.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The empty response returned when the instrument failed to answer.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Response text.
    pub fn text(&self) -> &str {
        &self.0
    }

    /// Whether nothing usable came back.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the response and return its text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a response is judged acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCheck {
    /// Any response, including an empty one.
    Any,
    /// The response must contain at least one of these tokens.
    ContainsAny(Vec<String>),
}

impl ResponseCheck {
    /// Check `text` against this policy.
    pub fn accepts(&self, text: &str) -> bool {
        match self {
            ResponseCheck::Any => true,
            ResponseCheck::ContainsAny(tokens) => tokens.iter().any(|t| text.contains(t.as_str())),
        }
    }
}

/// Defines a policy for retrying a command.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
    /// Acceptance check applied to each response.
    pub check: ResponseCheck,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_delay: Duration::from_secs(1),
            check: ResponseCheck::ContainsAny(vec![
                ACK_TOKEN.to_string(),
                IDENTITY_MARKER.to_string(),
            ]),
        }
    }
}

impl RetryPolicy {
    /// Accept the first response as-is. Only transport failures are retried.
    pub fn unvalidated(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay,
            check: ResponseCheck::Any,
        }
    }

    /// Require one of `tokens` in the response, retrying otherwise.
    pub fn validated<I, S>(max_attempts: u32, backoff_delay: Duration, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            max_attempts,
            backoff_delay,
            check: ResponseCheck::ContainsAny(tokens.into_iter().map(Into::into).collect()),
        }
    }
}

/// Per-command timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Idle gap that marks the end of a response.
    pub response_timeout: Duration,
    /// Settling delay between writing a command and reading its reply.
    pub post_send_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            post_send_delay: Duration::from_millis(500),
        }
    }
}

/// Line-oriented request/response channel.
///
/// `send` takes `&mut self`, so a channel never has more than one command in
/// flight.
pub struct CommandChannel<T: Transport> {
    transport: T,
}

impl<T: Transport> CommandChannel<T> {
    /// Wrap an open transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Whether the underlying connection is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Send `command` and collect its response according to `policy`.
    ///
    /// Never fails: transport errors and rejected responses count as failed
    /// attempts, and an empty [`Response`] is returned once the policy's
    /// attempts are used up.
    pub async fn send(
        &mut self,
        command: &Command,
        timing: Timing,
        policy: &RetryPolicy,
    ) -> Response {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.exchange(command, timing).await {
                Ok(text) if policy.check.accepts(&text) => return Response::new(text),
                Ok(_) => warn!(
                    "Unexpected response to {}, retrying... [{}/{}]",
                    command, attempt, max_attempts
                ),
                Err(e) => warn!("Attempt {} for {} failed: {}", attempt, command, e),
            }
            if attempt < max_attempts {
                sleep(policy.backoff_delay).await;
            }
        }

        error!(
            "Failed to send command after {} attempts: {}",
            max_attempts, command
        );
        Response::empty()
    }

    async fn exchange(
        &mut self,
        command: &Command,
        timing: Timing,
    ) -> Result<String, crate::error::TransportError> {
        info!("→ {}", command);
        self.transport.send_line(command.as_str()).await?;
        sleep(timing.post_send_delay).await;

        let mut raw = Vec::new();
        loop {
            let chunk = self
                .transport
                .read_available(timing.response_timeout)
                .await?;
            if chunk.is_empty() {
                break;
            }
            raw.extend_from_slice(&chunk);
        }

        let text = String::from_utf8_lossy(&raw).trim().to_string();
        info!("← {}", elide(&text));
        Ok(text)
    }
}

/// Summarize long payloads so full spectra don't swamp the log.
pub fn elide(text: &str) -> String {
    let chars = text.chars().count();
    if chars > LOG_ELISION_THRESHOLD {
        format!("(received {} chars)", chars)
    } else {
        text.to_string()
    }
}
