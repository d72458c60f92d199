//! Byte-stream transports to the spectrometer server.
//!
//! A transport owns one bidirectional stream and knows nothing about command
//! semantics: it writes newline-terminated lines and hands back whatever bytes
//! arrive. Framing, validation and retries live in [`crate::channel`].

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
pub mod tcp;

pub use mock::{MockConnector, MockTransport};
pub use tcp::{TcpConnector, TcpTransport};

/// Raw line-oriented I/O over a single connection.
#[async_trait]
pub trait Transport: Send {
    /// Write `line` followed by a newline terminator.
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Wait up to `idle_timeout` for data and return what arrived.
    ///
    /// An empty buffer means the stream stayed silent for the whole interval
    /// (or the peer closed it). Callers detect end-of-message by calling this
    /// repeatedly until it comes back empty.
    async fn read_available(&mut self, idle_timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;
}

/// Opens fresh transports to a fixed address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The transport type produced by this connector.
    type Transport: Transport;

    /// Open a new connection, failing if it cannot be established in `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<Self::Transport, TransportError>;

    /// Human-readable address used in logs.
    fn address(&self) -> &str;
}
