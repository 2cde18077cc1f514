//! The one-request/one-reply channel.

use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{tcp, unix, TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::debug;

use super::framing::{read_message, write_message};
use super::Endpoint;

/// Default bound on a single request/reply exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level failures.
///
/// These are always surfaced immediately to the caller; the channel never
/// retries on its own. Compiler-side *logical* errors are not transport
/// errors at all; they travel as diagnostic text on the error channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to connect to the endpoint.
    #[error("connection failed: {0}")]
    ConnectFailure(#[source] std::io::Error),

    /// No reply arrived within the configured bound.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The strict request/reply discipline was (or may have been) broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The channel was closed before (or during) the call.
    #[error("transport is closed")]
    TransportClosed,

    /// Framing or encoding error on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug)]
enum Wire {
    Tcp {
        reader: BufReader<tcp::OwnedReadHalf>,
        writer: tcp::OwnedWriteHalf,
    },
    Unix {
        reader: BufReader<unix::OwnedReadHalf>,
        writer: unix::OwnedWriteHalf,
    },
}

/// Synchronous request/reply channel to the compiler.
///
/// One command in, one reply out, in order. The `&mut self` receivers make
/// an overlapped second request impossible to express. The channel takes
/// no lock of its own; a caller sharing it across threads must serialize
/// access.
///
/// After a failed exchange (timeout or I/O error) the reply may still be
/// in flight, so the channel is poisoned: every further `request` fails
/// with [`TransportError::ProtocolViolation`] until the caller reconnects.
#[derive(Debug)]
pub struct Channel {
    wire: Option<Wire>,
    poisoned: bool,
    timeout: Duration,
}

impl Channel {
    /// Connect to the compiler at `endpoint`.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectFailure`] if nothing is listening there.
    pub async fn open(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let wire = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(TransportError::ConnectFailure)?;
                let (read_half, write_half) = stream.into_split();
                Wire::Tcp {
                    reader: BufReader::new(read_half),
                    writer: write_half,
                }
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(TransportError::ConnectFailure)?;
                let (read_half, write_half) = stream.into_split();
                Wire::Unix {
                    reader: BufReader::new(read_half),
                    writer: write_half,
                }
            }
        };
        debug!(%endpoint, "transport channel open");
        Ok(Self {
            wire: Some(wire),
            poisoned: false,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound applied to each request/reply exchange. Default 30 seconds.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_open(&self) -> bool {
        self.wire.is_some()
    }

    /// Send one command and wait for its single reply.
    ///
    /// # Errors
    ///
    /// - [`TransportError::TransportClosed`] after `close`
    /// - [`TransportError::ProtocolViolation`] on a poisoned channel
    /// - [`TransportError::Timeout`] if the reply does not arrive in time
    /// - [`TransportError::Protocol`] on framing/encoding failures
    pub async fn request(&mut self, command: &str) -> Result<String, TransportError> {
        if self.wire.is_none() {
            return Err(TransportError::TransportClosed);
        }
        if self.poisoned {
            return Err(TransportError::ProtocolViolation(
                "a previous exchange failed and its reply may still arrive out of turn; \
                 reconnect before issuing further requests"
                    .into(),
            ));
        }

        let bound = self.timeout;
        match timeout(bound, self.exchange(command)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                self.poisoned = true;
                Err(err)
            }
            Err(_) => {
                self.poisoned = true;
                Err(TransportError::Timeout(bound))
            }
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<String, TransportError> {
        let Some(wire) = self.wire.as_mut() else {
            return Err(TransportError::TransportClosed);
        };
        match wire {
            Wire::Tcp { reader, writer } => {
                write_message(writer, command)
                    .await
                    .map_err(|e| TransportError::Protocol(format!("failed to send request: {e:#}")))?;
                read_message(reader)
                    .await
                    .map_err(|e| TransportError::Protocol(format!("failed to read reply: {e:#}")))
            }
            Wire::Unix { reader, writer } => {
                write_message(writer, command)
                    .await
                    .map_err(|e| TransportError::Protocol(format!("failed to send request: {e:#}")))?;
                read_message(reader)
                    .await
                    .map_err(|e| TransportError::Protocol(format!("failed to read reply: {e:#}")))
            }
        }
    }

    /// Release the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.wire.take().is_some() {
            debug!("transport channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// One-shot echo server: answers every framed request with `reply`.
    async fn spawn_reply_server(reply: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            while let Ok(_request) = read_message(&mut reader).await {
                write_message(&mut write_half, reply).await.unwrap();
            }
        });
        Endpoint::Tcp(addr.to_string())
    }

    /// Server that reads requests but never answers.
    async fn spawn_silent_server() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            while read_message(&mut reader).await.is_ok() {}
        });
        Endpoint::Tcp(addr.to_string())
    }

    #[tokio::test]
    async fn test_request_reply() {
        let endpoint = spawn_reply_server("\"v1.24.0\"").await;
        let mut channel = Channel::open(&endpoint).await.unwrap();

        let reply = channel.request("getVersion()").await.unwrap();
        assert_eq!(reply, "\"v1.24.0\"");

        // Sequential requests on the same channel stay in order.
        let reply = channel.request("getVersion()").await.unwrap();
        assert_eq!(reply, "\"v1.24.0\"");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Port 1 on loopback: nothing listens there.
        let endpoint = Endpoint::Tcp("127.0.0.1:1".into());
        let err = Channel::open(&endpoint).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailure(_)));
    }

    #[tokio::test]
    async fn test_timeout_poisons_the_channel() {
        let endpoint = spawn_silent_server().await;
        let mut channel = Channel::open(&endpoint).await.unwrap();
        channel.set_timeout(Duration::from_millis(50));

        let err = channel.request("simulate(Slow)").await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");

        // The late reply could arrive out of turn; a second request is a
        // protocol violation until the caller reconnects.
        let err = channel.request("getVersion()").await.unwrap_err();
        assert!(
            matches!(err, TransportError::ProtocolViolation(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_request_after_close() {
        let endpoint = spawn_reply_server("true").await;
        let mut channel = Channel::open(&endpoint).await.unwrap();
        channel.close();
        // Idempotent.
        channel.close();

        let err = channel.request("getVersion()").await.unwrap_err();
        assert!(matches!(err, TransportError::TransportClosed));
    }
}
