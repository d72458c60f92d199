//! Scripted in-memory transport for testing
//!
//! This transport stands in for the spectrometer server so the command channel,
//! readiness loop and orchestrator can be exercised without a socket. It
//! provides:
//! - Scripted responses per command line (queued, last one repeats)
//! - Failure injection for the next send
//! - A log of every line sent, for test verification

use super::{Connector, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct Script {
    responses: HashMap<String, VecDeque<String>>,
    pending: VecDeque<Vec<u8>>,
    sent: Vec<String>,
}

/// Scripted transport
///
/// Clones share state, so a test can keep a handle to inspect the sent lines
/// after the transport has been moved into a channel.
///
/// # Example
///
/// ```
/// use spectro_daq::transport::MockTransport;
///
/// let transport = MockTransport::new()
///     .respond("*IDN?", "OK\nARCspectro FTIR")
///     .respond_sequence("MEAS:REM?", ["OK\n\n2", "OK\n\n0"]);
/// assert!(transport.sent().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    open: Arc<AtomicBool>,
    fail_next_send: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create an open transport with no scripted responses.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            open: Arc::new(AtomicBool::new(true)),
            fail_next_send: Arc::new(AtomicBool::new(false)),
            close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answer `command` with `response`.
    pub fn respond(self, command: &str, response: &str) -> Self {
        self.respond_sequence(command, [response])
    }

    /// Answer successive `command`s with `responses` in order; the last one
    /// repeats once the queue is down to a single entry.
    pub fn respond_sequence<I, S>(self, command: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().responses.insert(
            command.to_string(),
            responses.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Make the next `send_line` fail with a connection reset.
    pub fn inject_next_failure(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    /// Every line sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// How many times `close` has been called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn next_response(script: &mut Script, command: &str) -> Option<String> {
        let queue = script.responses.get_mut(command)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Injected failure",
            )));
        }

        let mut script = self.lock();
        script.sent.push(line.to_string());
        // A new command discards anything left unread from the previous one.
        script.pending.clear();
        if let Some(response) = Self::next_response(&mut script, line) {
            script.pending.push_back(response.into_bytes());
        }
        Ok(())
    }

    async fn read_available(&mut self, _idle_timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.lock().pending.pop_front().unwrap_or_default())
    }

    async fn close(&mut self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

type ConnectFn = dyn Fn(usize) -> Result<MockTransport, TransportError> + Send + Sync;

/// Connector that hands out transports from a factory closure
///
/// The closure receives the zero-based connection attempt number, which lets a
/// test simulate a server that only becomes reachable after a few attempts.
#[derive(Clone)]
pub struct MockConnector {
    factory: Arc<ConnectFn>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Create a connector from a factory closure.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(usize) -> Result<MockTransport, TransportError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connector whose every attempt is refused.
    pub fn refusing() -> Self {
        Self::new(|_| Err(refused()))
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Connection-refused error as produced by a server that is not listening yet.
pub fn refused() -> TransportError {
    TransportError::Connect {
        address: "mock".to_string(),
        source: io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused"),
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, _timeout: Duration) -> Result<MockTransport, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        (self.factory)(attempt)
    }

    fn address(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_scripted_response() {
        let mut transport = MockTransport::new().respond("*IDN?", "ARCspectro");
        transport.send_line("*IDN?").await.unwrap();
        let chunk = transport.read_available(Duration::ZERO).await.unwrap();
        assert_eq!(chunk, b"ARCspectro");
        // Drained.
        assert!(transport
            .read_available(Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_mock_transport_sequence_repeats_last() {
        let mut transport = MockTransport::new().respond_sequence("MEAS:REM?", ["2", "0"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            transport.send_line("MEAS:REM?").await.unwrap();
            let chunk = transport.read_available(Duration::ZERO).await.unwrap();
            seen.push(String::from_utf8(chunk).unwrap());
        }
        assert_eq!(seen, vec!["2", "0", "0"]);
    }

    #[tokio::test]
    async fn test_mock_transport_unknown_command_is_silent() {
        let mut transport = MockTransport::new();
        transport.send_line("SPEC:GET?").await.unwrap();
        assert!(transport
            .read_available(Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(transport.sent(), vec!["SPEC:GET?"]);
    }

    #[tokio::test]
    async fn test_mock_transport_failure_injection() {
        let mut transport = MockTransport::new();
        transport.inject_next_failure();
        assert!(transport.send_line("*IDN?").await.is_err());
        // Failure should be consumed
        assert!(transport.send_line("*IDN?").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_close() {
        let handle = MockTransport::new();
        let mut transport = handle.clone();
        transport.close().await;
        transport.close().await;
        assert!(!handle.is_open());
        assert_eq!(handle.close_calls(), 2);
        assert!(matches!(
            transport.send_line("*IDN?").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_connector_counts_attempts() {
        let connector = MockConnector::new(|attempt| {
            if attempt < 2 {
                Err(refused())
            } else {
                Ok(MockTransport::new())
            }
        });
        assert!(connector.connect(Duration::ZERO).await.is_err());
        assert!(connector.connect(Duration::ZERO).await.is_err());
        assert!(connector.connect(Duration::ZERO).await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
