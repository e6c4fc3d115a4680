//! Transport contract consumed by the session layer.
//!
//! The byte-level transports themselves (TCP sockets, WebSocket framing,
//! the TLS handshake, zlib) live outside this crate; the core only needs a
//! duplex byte channel it can instruct to upgrade. `MemoryTransport` is the
//! shipped in-process implementation used by the test suites and by
//! embedders that terminate connections elsewhere.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::error::XmppError;

/// Kind of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Long-lived stream socket; STARTTLS and compression negotiate in-band.
    Socket,
    /// Request-framed connection; secured and framed by the outer layer.
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// zlib compression level negotiated via the compress feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Compression disabled; the feature is not advertised.
    #[default]
    None,
    Default,
    Best,
    Speed,
}

/// Duplex byte channel under an XMPP stream.
#[async_trait]
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// The connection kind, which drives feature advertising.
    fn kind(&self) -> TransportKind;

    /// Switch the channel to TLS using the given server configuration.
    ///
    /// Called after `<proceed/>` has been written; subsequent reads and
    /// writes go through the secured channel.
    async fn start_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<(), XmppError>;

    /// Switch the channel to zlib compression at the given level.
    ///
    /// Called after `<compressed/>` has been written.
    async fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError>;

    /// TLS channel-binding data (`tls-unique`), when the channel is secured
    /// and the implementation exposes it. Consumed by SCRAM `-PLUS`.
    fn channel_binding(&self) -> Option<Vec<u8>>;
}

/// Observable upgrade state of a [`MemoryTransport`], shared with tests.
#[derive(Debug, Default)]
pub struct MemoryTransportState {
    tls_started: AtomicBool,
    compression_enabled: AtomicBool,
}

impl MemoryTransportState {
    /// Whether `start_tls` has been called.
    pub fn tls_started(&self) -> bool {
        self.tls_started.load(Ordering::Acquire)
    }

    /// Whether `enable_compression` has been called.
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Acquire)
    }
}

/// In-process transport over a tokio duplex pipe.
///
/// Upgrades are recorded rather than performed; the peer end is handed to
/// the embedder (or the test) as a plain `DuplexStream`.
pub struct MemoryTransport {
    inner: DuplexStream,
    kind: TransportKind,
    state: Arc<MemoryTransportState>,
    channel_binding: Option<Vec<u8>>,
}

impl MemoryTransport {
    /// Create a transport pair: the server-side transport and the peer end.
    pub fn pair(kind: TransportKind, capacity: usize) -> (Self, DuplexStream) {
        let (server, client) = tokio::io::duplex(capacity);
        (
            Self {
                inner: server,
                kind,
                state: Arc::new(MemoryTransportState::default()),
                channel_binding: None,
            },
            client,
        )
    }

    /// Attach channel-binding data, as a secured transport would expose.
    pub fn with_channel_binding(mut self, data: Vec<u8>) -> Self {
        self.channel_binding = Some(data);
        self
    }

    /// Handle to the observable upgrade state.
    pub fn state(&self) -> Arc<MemoryTransportState> {
        Arc::clone(&self.state)
    }
}

impl AsyncRead for MemoryTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start_tls(&mut self, _config: Arc<rustls::ServerConfig>) -> Result<(), XmppError> {
        self.state.tls_started.store(true, Ordering::Release);
        Ok(())
    }

    async fn enable_compression(&mut self, _level: CompressionLevel) -> Result<(), XmppError> {
        self.state.compression_enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.channel_binding.clone()
    }
}

/// Certificate resolver that never resolves.
///
/// Suitable only for transports that record the TLS instruction instead of
/// performing a handshake, such as [`MemoryTransport`].
#[derive(Debug)]
struct NoServerCert;

impl rustls::server::ResolvesServerCert for NoServerCert {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        None
    }
}

/// Build a certificate-less TLS configuration for recording transports.
pub fn passthrough_tls_config() -> Arc<rustls::ServerConfig> {
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoServerCert)),
    )
}
