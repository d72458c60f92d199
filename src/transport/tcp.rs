//! TCP transport built on tokio's `TcpStream`.

use super::{Connector, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Size of a single socket read.
const READ_CHUNK_SIZE: usize = 65536;

/// TCP connection to the spectrometer server.
pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
    /// Peer closed its write half; further reads return nothing.
    eof: bool,
}

impl TcpTransport {
    /// Connect to `address` (e.g. `"127.0.0.1:1242"`).
    ///
    /// # Errors
    /// Returns [`TransportError::ConnectTimeout`] if the handshake does not
    /// complete within `connect_timeout`, or [`TransportError::Connect`] if the
    /// connection is refused or the address cannot be resolved.
    pub async fn open(address: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        debug!("Connecting to {}", address);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    address: address.to_string(),
                    timeout: connect_timeout,
                })
            }
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            address: address.to_string(),
            stream: Some(stream),
            eof: false,
        })
    }

    /// Address this transport was opened against.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self, idle_timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        if self.eof {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match tokio::time::timeout(idle_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!("Peer {} closed the connection", self.address);
                self.eof = true;
                Ok(Vec::new())
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(e.into()),
            // Silence for the whole idle interval: end of this message.
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down connection to {}: {}", self.address, e);
            }
            debug!("Connection to {} closed", self.address);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Opens [`TcpTransport`]s to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Create a connector for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, timeout: Duration) -> Result<TcpTransport, TransportError> {
        TcpTransport::open(&self.address, timeout).await
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_line_and_read_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(format!("echo:{}\n", line).as_bytes())
                .await
                .unwrap();
            // Keep the connection open until the client is done.
            let _ = lines.next_line().await;
        });

        let mut transport = TcpTransport::open(&address, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(transport.is_open());
        transport.send_line("*IDN?").await.unwrap();

        let chunk = transport
            .read_available(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&chunk), "echo:*IDN?\n");

        // Nothing else is coming: idle timeout yields an empty read.
        let idle = transport
            .read_available(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(idle.is_empty());

        transport.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let mut transport = TcpTransport::open(&address, Duration::from_secs(1))
            .await
            .unwrap();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send_line("*IDN?").await,
            Err(TransportError::NotConnected)
        ));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector::new(address.clone())
            .connect(Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Name resolution cannot finish within a zero timeout.
        let result = TcpTransport::open("localhost:1242", Duration::ZERO).await;
        match result {
            Err(TransportError::ConnectTimeout { address, timeout }) => {
                assert_eq!(address, "localhost:1242");
                assert_eq!(timeout, Duration::ZERO);
            }
            other => panic!("expected connect timeout, got {:?}", other.err()),
        }
    }
}
