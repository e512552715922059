use crate::error::{Error, Result};
use crate::types::Protocol;
use log::{debug, trace};
use rustls::{OwnedTrustAnchor, RootCertStore, ServerName};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Byte-stream transport under one connection: read/write plus what was
/// negotiated during setup. TLS, plain TCP and the in-memory test pipe all
/// come through here.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
    /// Protocol selected by ALPN, or `None` when nothing was negotiated
    /// (cleartext).
    fn alpn_protocol(&self) -> Option<Protocol>;
}

pub type BoxedTransport = Box<dyn Transport>;

/// TLS over TCP, the production transport.
pub struct TlsSocket {
    inner: TlsStream<TcpStream>,
}

impl TlsSocket {
    #[must_use]
    pub fn new(inner: TlsStream<TcpStream>) -> Self {
        Self { inner }
    }
}

impl Transport for TlsSocket {
    fn alpn_protocol(&self) -> Option<Protocol> {
        let (_, session) = self.inner.get_ref();
        match session.alpn_protocol() {
            Some(b"h2") => Some(Protocol::Http2),
            Some(b"http/1.1") => Some(Protocol::Http11),
            _ => None,
        }
    }
}

impl AsyncRead for TlsSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsSocket {
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

/// Cleartext TCP. No ALPN, so the pool treats it as HTTP/1.1 unless the
/// client was configured with prior knowledge.
pub struct TcpSocket {
    inner: TcpStream,
}

impl TcpSocket {
    #[must_use]
    pub fn new(inner: TcpStream) -> Self {
        Self { inner }
    }
}

impl Transport for TcpSocket {
    fn alpn_protocol(&self) -> Option<Protocol> {
        None
    }
}

impl AsyncRead for TcpSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpSocket {
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

/// In-memory pipe with a fixed ALPN answer. The hermetic test suites speak
/// real frames through this instead of a network.
pub struct InMemory {
    inner: DuplexStream,
    alpn: Option<Protocol>,
}

impl InMemory {
    /// Client-side transport plus the raw server end of the pipe.
    #[must_use]
    pub fn pair(alpn: Option<Protocol>, capacity: usize) -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(capacity);
        (
            Self {
                inner: client,
                alpn,
            },
            server,
        )
    }
}

impl Transport for InMemory {
    fn alpn_protocol(&self) -> Option<Protocol> {
        self.alpn
    }
}

impl AsyncRead for InMemory {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InMemory {
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

/// Certificate verifier that accepts anything; only reachable through
/// `verify_tls: false`.
struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Client TLS config with the webpki roots, advertising both `h2` and
/// `http/1.1` so the server picks via ALPN.
#[must_use]
pub fn tls_config(verify_tls: bool) -> Arc<rustls::ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if !verify_tls {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
    }
    Arc::new(config)
}

/// Open a TLS transport to `host:port` within `connect_timeout`, reporting
/// the ALPN outcome.
pub async fn connect_tls(
    host: &str,
    port: u16,
    config: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
) -> Result<TlsSocket> {
    let connect = async {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let server_name = ServerName::try_from(host)
            .map_err(|_| Error::InvalidRequest(format!("invalid host name {host:?}")))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await?;
        Ok::<_, Error>(TlsSocket::new(tls))
    };
    let socket = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;
    let alpn = socket.alpn_protocol();
    debug!("connected to {host}:{port}, alpn {alpn:?}");
    Ok(socket)
}

/// Open a cleartext transport to `host:port` within `connect_timeout`.
pub async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpSocket> {
    let connect = async {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        Ok::<_, Error>(TcpSocket::new(tcp))
    };
    let socket = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| Error::Timeout(connect_timeout))??;
    trace!("connected to {host}:{port} (cleartext)");
    Ok(socket)
}
