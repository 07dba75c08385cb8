//! Stream transport for controller exchanges.
//!
//! A [`Transport`] opens one [`Connection`] per logical exchange. A
//! connection writes a request line and reads exactly one reply line, each
//! bounded by the configured timeout. Retry is never attempted here; the
//! polling engine decides what a failure means.
//!
//! # Types
//!
//! - [`StreamIO`]: trait alias for anything that is `AsyncRead + AsyncWrite`
//! - [`DynStream`]: type-erased boxed stream
//! - [`Connection`]: buffered line exchange over a [`DynStream`]
//! - [`TcpTransport`]: connects to the controller over TCP

use crate::error::{AppResult, AxisError};
use async_trait::async_trait;
use std::any::Any;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for async byte streams.
///
/// Implemented by `tokio::net::TcpStream` for the real controller and by
/// `tokio::io::DuplexStream` for the in-memory simulator.
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIO>;

/// Longest reply line accepted from the controller, newline included.
pub const MAX_REPLY_BYTES: u64 = 1024;

// =============================================================================
// Connection
// =============================================================================

/// One open connection to the controller.
///
/// Several request lines may be sent on the same connection; the query's
/// positional fallback relies on this.
pub struct Connection {
    stream: BufReader<DynStream>,
    timeout: Duration,
    peer: String,
    lease: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(stream: DynStream, timeout: Duration, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
            peer: peer.into(),
            lease: None,
        }
    }

    /// Attach a value that lives exactly as long as this connection.
    pub fn with_lease(mut self, lease: impl Any + Send) -> Self {
        self.lease = Some(Box::new(lease));
        self
    }

    /// Peer description for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one request line and read one reply line.
    ///
    /// The reply is returned trimmed. A peer that closes the connection
    /// without answering yields an empty reply, which the codec rejects.
    /// A reply without a line end within [`MAX_REPLY_BYTES`] is rejected
    /// as undecodable.
    pub async fn exchange(&mut self, request: &str) -> AppResult<String> {
        let line = format!("{request}\n");
        let timeout_ms = self.timeout.as_millis() as u64;

        let writer = self.stream.get_mut();
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| AxisError::Timeout {
                during: format!("sending '{request}'"),
                timeout_ms,
            })??;

        let mut response = String::new();
        let mut bounded = (&mut self.stream).take(MAX_REPLY_BYTES);
        let read = tokio::time::timeout(self.timeout, bounded.read_line(&mut response))
            .await
            .map_err(|_| AxisError::Timeout {
                during: format!("reply to '{request}'"),
                timeout_ms,
            })??;
        trace!(target: "axis_tool::transport", peer = %self.peer(), bytes = read, "reply line read");
        if read as u64 == MAX_REPLY_BYTES && !response.ends_with('\n') {
            return Err(AxisError::decode(request, format!("reply exceeds {MAX_REPLY_BYTES} bytes")));
        }

        Ok(response.trim().to_string())
    }
}

// =============================================================================
// Transport Trait
// =============================================================================

/// Something that can open connections to the controller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh connection.
    async fn connect(&self) -> AppResult<Connection>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// TCP transport to the real controller.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    timeout: Duration,
}

impl TcpTransport {
    /// Transport to `host:port` with a per-operation timeout.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            address: format!("{host}:{port}"),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> AppResult<Connection> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| AxisError::Timeout {
                during: format!("connecting to {}", self.address),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::ConnectionRefused => AxisError::ConnectionRefused {
                    endpoint: self.address.clone(),
                    reason: err.to_string(),
                },
                _ => AxisError::Io(err),
            })?;
        stream.set_nodelay(true)?;
        Ok(Connection::new(Box::new(stream), self.timeout, self.address.clone()))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn exchange_writes_line_and_reads_reply() {
        let (client, server) = duplex(256);
        let mut conn = Connection::new(Box::new(client), Duration::from_millis(500), "duplex");
        assert_eq!(conn.peer(), "duplex");

        let device = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "get/bl_41in_x/query\n");
            reader
                .get_mut()
                .write_all(b"get/bl_41in_x/query/inactive_500pulse\n")
                .await
                .unwrap();
        });

        let reply = conn.exchange("get/bl_41in_x/query").await.unwrap();
        assert_eq!(reply, "get/bl_41in_x/query/inactive_500pulse");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn unterminated_oversized_reply_is_rejected() {
        let (client, server) = duplex(4096);
        let mut conn = Connection::new(Box::new(client), Duration::from_millis(500), "duplex");

        let device = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(&[b'7'; 3000]).await.unwrap();
            // Hold the stream open so the read cannot end at EOF.
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let err = conn.exchange("get/bl_41in_x/query").await.unwrap_err();
        assert!(matches!(err, AxisError::Decode { .. }), "unexpected error {err}");
        assert!(err.to_string().contains("1024"));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (client, _server) = duplex(256);
        let mut conn = Connection::new(Box::new(client), Duration::from_millis(30), "duplex");
        let err = conn.exchange("get/bl_41in_x/status").await.unwrap_err();
        assert!(matches!(err, AxisError::Timeout { timeout_ms: 30, .. }));
        assert!(err.is_communication_failure());
    }

    #[tokio::test]
    async fn closed_peer_yields_empty_reply() {
        let (client, server) = duplex(256);
        drop(server);
        let mut conn = Connection::new(Box::new(client), Duration::from_millis(100), "duplex");
        // Writing into a closed duplex fails; either outcome is a failure upstream.
        match conn.exchange("get/bl_41in_x/query").await {
            Ok(reply) => assert!(reply.is_empty()),
            Err(err) => assert!(err.is_communication_failure()),
        }
    }

    #[tokio::test]
    async fn refused_tcp_connection_is_classified() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new("127.0.0.1", port, Duration::from_millis(500));
        let err = transport.connect().await.unwrap_err();
        assert!(err.is_communication_failure(), "unexpected error {err}");
        assert_eq!(transport.describe(), format!("tcp://127.0.0.1:{port}"));
    }
}
