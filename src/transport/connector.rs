//! Connection establishment: TCP (optionally through a proxy tunnel), the
//! BoringSSL handshake, and ALPN-driven protocol selection. QUIC is set up
//! separately through [`Connector::connect_quic`].

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine as _;
use boring::x509::X509VerifyResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;
use url::Url;

use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::fingerprint::{build_quic_config, BrowserProfile, TlsConfig};
use crate::timeouts::{within, Timeouts};
use crate::transport::h1::H1Connection;
use crate::transport::h2::{self, H2Handle};
use crate::transport::h3::{self, H3Handle};
use crate::transport::tcp::{self, TcpFingerprint};
use crate::transport::Origin;
use crate::version::HttpVersion;

/// Largest CONNECT reply head we accept from a proxy.
const MAX_PROXY_REPLY: usize = 8 * 1024;

/// Stream that is either plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl MaybeTlsStream {
    /// Protocol selected by ALPN; plain connections have none.
    pub fn alpn_protocol(&self) -> Option<HttpVersion> {
        match self {
            MaybeTlsStream::Plain(_) => None,
            MaybeTlsStream::Tls(stream) => stream
                .ssl()
                .selected_alpn_protocol()
                .and_then(HttpVersion::from_alpn),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// An established connection speaking exactly one protocol.
#[derive(Debug)]
pub enum Connection {
    H1(H1Connection),
    H2(H2Handle),
    H3(H3Handle),
}

impl Connection {
    pub fn version(&self) -> HttpVersion {
        match self {
            Connection::H1(_) => HttpVersion::Http1_1,
            Connection::H2(_) => HttpVersion::Http2,
            Connection::H3(_) => HttpVersion::Http3,
        }
    }

    /// Streams this connection may carry at once.
    pub fn max_streams(&self) -> usize {
        match self {
            Connection::H1(_) => 1,
            Connection::H2(handle) => handle.max_concurrent_streams().max(1) as usize,
            Connection::H3(handle) => handle.max_concurrent_streams().max(1) as usize,
        }
    }

    /// No new request may be started on this connection.
    pub fn is_closed(&self) -> bool {
        match self {
            Connection::H1(conn) => !conn.is_reusable(),
            Connection::H2(handle) => handle.is_closed(),
            Connection::H3(handle) => handle.is_closed(),
        }
    }
}

/// HTTP proxy parsed from a `http://[user:pass@]host:port` URL.
#[derive(Clone, PartialEq, Eq)]
pub struct Proxy {
    host: String,
    port: u16,
    authorization: Option<String>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Proxy {
    pub fn parse(proxy_url: &str) -> Result<Self> {
        let url = Url::parse(proxy_url)?;
        if url.scheme() != "http" {
            return Err(Error::configuration(format!(
                "unsupported proxy scheme {:?}; only http:// proxies are supported",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_url("proxy URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let authorization = if url.username().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            ))
        };
        Ok(Self {
            host,
            port,
            authorization,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `Proxy-Authorization` value, when the proxy URL carried credentials.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// Open a `CONNECT` tunnel to `origin` over `stream`.
    async fn tunnel(&self, mut stream: TcpStream, origin: &Origin) -> Result<TcpStream> {
        let target = origin.host_port();
        let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.authorization {
            head.push_str("Proxy-Authorization: ");
            head.push_str(auth);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let tunnel_err = |e| classify_io(e, TransportPhase::ProxyTunnel);
        stream.write_all(head.as_bytes()).await.map_err(tunnel_err)?;

        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        loop {
            let n = stream.read(&mut chunk).await.map_err(tunnel_err)?;
            if n == 0 {
                return Err(Error::proxy("proxy closed the connection during CONNECT"));
            }
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut reply = httparse::Response::new(&mut headers);
            match reply.parse(&buf) {
                Ok(httparse::Status::Complete(_)) => {
                    let code = reply.code.unwrap_or(0);
                    if (200..300).contains(&code) {
                        tracing::debug!(proxy = %self.host, %target, "CONNECT tunnel established");
                        return Ok(stream);
                    }
                    return Err(Error::proxy(format!(
                        "proxy refused CONNECT to {}: {} {}",
                        target,
                        code,
                        reply.reason.unwrap_or("")
                    )));
                }
                Ok(httparse::Status::Partial) if buf.len() < MAX_PROXY_REPLY => continue,
                Ok(httparse::Status::Partial) => {
                    return Err(Error::proxy("proxy CONNECT reply too large"));
                }
                Err(e) => return Err(Error::proxy(format!("malformed proxy CONNECT reply: {}", e))),
            }
        }
    }
}

/// Opens connections that look like the configured browser.
#[derive(Debug, Clone)]
pub struct Connector {
    tls: Arc<TlsConfig>,
    profile: &'static BrowserProfile,
    verify: bool,
    roots: Arc<Vec<Vec<u8>>>,
    proxy: Option<Proxy>,
    local_address: Option<IpAddr>,
    tcp_fingerprint: Option<TcpFingerprint>,
}

impl Connector {
    pub fn new(
        tls: TlsConfig,
        profile: &'static BrowserProfile,
        roots: Vec<Vec<u8>>,
        proxy: Option<Proxy>,
        local_address: Option<IpAddr>,
        tcp_fingerprint: Option<TcpFingerprint>,
    ) -> Self {
        Self {
            verify: tls.verify(),
            tls: Arc::new(tls),
            profile,
            roots: Arc::new(roots),
            proxy,
            local_address,
            tcp_fingerprint,
        }
    }

    pub fn profile(&self) -> &'static BrowserProfile {
        self.profile
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Plain-HTTP requests through a proxy use absolute-form targets.
    pub fn uses_absolute_form(&self, origin: &Origin) -> bool {
        self.proxy.is_some() && !origin.is_https()
    }

    /// Credentials to send in-band for plain-HTTP requests via the proxy.
    pub fn proxy_authorization(&self, origin: &Origin) -> Option<&str> {
        if origin.is_https() {
            return None;
        }
        self.proxy.as_ref().and_then(Proxy::authorization)
    }

    /// Open a TCP connection to `origin` and negotiate HTTP/1.1 or HTTP/2.
    pub async fn connect(&self, origin: &Origin, timeouts: &Timeouts) -> Result<Connection> {
        self.connect_tcp(origin, timeouts)
            .await
            .map_err(|e| e.with_origin(origin))
    }

    async fn connect_tcp(&self, origin: &Origin, timeouts: &Timeouts) -> Result<Connection> {
        let (host, port) = match &self.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (origin.host(), origin.port()),
        };
        let mut stream = within(
            timeouts.connect,
            Error::connect_timeout,
            tcp::connect(host, port, self.local_address, self.tcp_fingerprint.as_ref()),
        )
        .await?;

        if let (Some(proxy), true) = (&self.proxy, origin.is_https()) {
            stream = within(timeouts.connect, Error::connect_timeout, proxy.tunnel(stream, origin))
                .await?;
        }

        if !origin.is_https() {
            tracing::debug!(%origin, "connected (plain HTTP/1.1)");
            return Ok(Connection::H1(H1Connection::new(MaybeTlsStream::Plain(stream))));
        }

        let tls = within(
            timeouts.tls_budget(),
            Error::connect_timeout,
            self.handshake(origin, stream),
        )
        .await
        .map_err(|e| e.with_phase(TransportPhase::TlsHandshake))?;

        let stream = MaybeTlsStream::Tls(tls);
        match stream.alpn_protocol() {
            Some(HttpVersion::Http2) => {
                tracing::debug!(%origin, "ALPN selected h2");
                let handle = h2::handshake(stream, &self.profile.http2, timeouts.write).await?;
                Ok(Connection::H2(handle))
            }
            Some(HttpVersion::Http3) => Err(Error::remote_protocol(
                "server selected h3 over TCP",
            )),
            _ => {
                tracing::debug!(%origin, "ALPN selected http/1.1");
                Ok(Connection::H1(H1Connection::new(stream)))
            }
        }
    }

    async fn handshake(&self, origin: &Origin, stream: TcpStream) -> Result<SslStream<TcpStream>> {
        let mut config = self
            .tls
            .connector()
            .configure()
            .map_err(|e| Error::configuration(format!("failed to configure TLS session: {}", e)))?;
        config.set_verify_hostname(self.verify);
        // SNI carries names only
        let is_ip = origin.host().parse::<IpAddr>().is_ok();
        config.set_use_server_name_indication(!is_ip);

        tokio_boring::connect(config, origin.host(), stream)
            .await
            .map_err(classify_handshake)
    }

    /// Open a QUIC connection to `origin`. Never falls back to TCP.
    pub async fn connect_quic(&self, origin: &Origin, timeouts: &Timeouts) -> Result<Connection> {
        if self.proxy.is_some() {
            return Err(Error::proxy("HTTP/3 cannot be tunnelled through an HTTP proxy")
                .with_origin(origin));
        }
        let config = build_quic_config(self.profile, self.verify, &self.roots)?;
        let handle = h3::connect(
            origin,
            config,
            self.local_address,
            self.profile,
            timeouts.connect,
        )
        .await?;
        Ok(Connection::H3(handle))
    }
}

/// Certificate and socket failures are connect errors; anything else during
/// the handshake is the peer misbehaving.
fn classify_handshake<S>(err: tokio_boring::HandshakeError<S>) -> Error {
    let message = format!("TLS handshake failed: {}", err);
    let verify_failed = err
        .ssl()
        .map(|ssl| ssl.verify_result() != X509VerifyResult::OK)
        .unwrap_or(false);
    let error = if verify_failed || err.as_io_error().is_some() {
        Error::connect(message)
    } else {
        Error::remote_protocol(message)
    };
    error.with_phase(TransportPhase::TlsHandshake)
}
