//! Error types for the guise crate.
//!
//! Every failure surfaces as an [`Error`] whose [`ErrorKind`] is one of a
//! closed set. Callers match on the kind (and on the optional
//! [`TransportPhase`] / [`ProtocolActor`] discriminants) to decide whether to
//! retry, fail fast, or switch protocol or browser profile.
//!
//! The kinds form a shallow taxonomy:
//!
//! - request errors: transport errors plus `DecodingError` and `TooManyRedirects`
//! - transport errors: timeouts (connect/read/write/pool), network errors
//!   (connect/read/write/close), protocol errors (local/remote), `ProxyError`,
//!   `UnsupportedProtocol`
//! - stream errors: `ResponseNotRead`, `RequestNotRead`, `StreamConsumed`, `StreamClosed`
//! - standalone: `HttpStatusError`, `InvalidUrl`, `CookieConflict`, `Configuration`

use std::fmt;
use std::io;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport open (TCP, proxy tunnel, TLS or QUIC handshake) exceeded its budget.
    ConnectTimeout,
    /// No response bytes arrived within the read budget.
    ReadTimeout,
    /// Request bytes could not be written within the write budget.
    WriteTimeout,
    /// No connection slot became available within the pool-wait budget.
    PoolTimeout,
    /// DNS failure, refused or unreachable peer, failed handshake.
    ConnectError,
    /// Socket failure while reading a response.
    ReadError,
    /// Socket failure while writing a request.
    WriteError,
    /// Failure while shutting a connection down.
    CloseError,
    /// This engine produced an invalid message.
    LocalProtocolError,
    /// The peer sent invalid data or reset the stream.
    RemoteProtocolError,
    /// Proxy refused or broke the CONNECT tunnel.
    ProxyError,
    /// Scheme other than http/https.
    UnsupportedProtocol,
    /// Body could not be decoded (content-encoding, charset or JSON).
    DecodingError,
    /// Redirect chain longer than the configured maximum.
    TooManyRedirects,
    /// Raised by [`Response::error_for_status`](crate::Response::error_for_status).
    HttpStatusError,
    /// Malformed URL.
    InvalidUrl,
    /// One cookie name resolves to several values.
    CookieConflict,
    /// Decoded body accessed before it was read.
    ResponseNotRead,
    /// Request body accessed before it was read.
    RequestNotRead,
    /// Body stream already consumed.
    StreamConsumed,
    /// Body stream already closed.
    StreamClosed,
    /// Invalid client configuration or unknown browser profile.
    Configuration,
}

impl ErrorKind {
    /// Name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "ConnectTimeout",
            Self::ReadTimeout => "ReadTimeout",
            Self::WriteTimeout => "WriteTimeout",
            Self::PoolTimeout => "PoolTimeout",
            Self::ConnectError => "ConnectError",
            Self::ReadError => "ReadError",
            Self::WriteError => "WriteError",
            Self::CloseError => "CloseError",
            Self::LocalProtocolError => "LocalProtocolError",
            Self::RemoteProtocolError => "RemoteProtocolError",
            Self::ProxyError => "ProxyError",
            Self::UnsupportedProtocol => "UnsupportedProtocol",
            Self::DecodingError => "DecodingError",
            Self::TooManyRedirects => "TooManyRedirects",
            Self::HttpStatusError => "HTTPStatusError",
            Self::InvalidUrl => "InvalidURL",
            Self::CookieConflict => "CookieConflict",
            Self::ResponseNotRead => "ResponseNotRead",
            Self::RequestNotRead => "RequestNotRead",
            Self::StreamConsumed => "StreamConsumed",
            Self::StreamClosed => "StreamClosed",
            Self::Configuration => "Configuration",
        }
    }

    /// Connect/read/write/pool timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::ReadTimeout | Self::WriteTimeout | Self::PoolTimeout
        )
    }

    /// Connect/read/write/close network failure.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::ConnectError | Self::ReadError | Self::WriteError | Self::CloseError
        )
    }

    /// Local or remote protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::LocalProtocolError | Self::RemoteProtocolError)
    }

    /// Any failure of the connection or protocol layer.
    pub fn is_transport(&self) -> bool {
        self.is_timeout()
            || self.is_network()
            || self.is_protocol()
            || matches!(self, Self::ProxyError | Self::UnsupportedProtocol)
    }

    /// Any failure while producing a response.
    pub fn is_request_error(&self) -> bool {
        self.is_transport() || matches!(self, Self::DecodingError | Self::TooManyRedirects)
    }

    /// Body-consumption protocol violation.
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            Self::ResponseNotRead | Self::RequestNotRead | Self::StreamConsumed | Self::StreamClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// I/O phase in which a transport error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportPhase {
    Connect,
    TlsHandshake,
    ProxyTunnel,
    Write,
    Read,
    Close,
    PoolWait,
}

impl TransportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::TlsHandshake => "tls-handshake",
            Self::ProxyTunnel => "proxy-tunnel",
            Self::Write => "write",
            Self::Read => "read",
            Self::Close => "close",
            Self::PoolWait => "pool-wait",
        }
    }
}

/// Which side violated the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolActor {
    Local,
    Remote,
}

/// Errors that can occur during HTTP operations.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}: {message}", context_suffix(.phase, .origin))]
pub struct Error {
    kind: ErrorKind,
    phase: Option<TransportPhase>,
    actor: Option<ProtocolActor>,
    origin: Option<String>,
    status: Option<u16>,
    message: String,
    #[source]
    source: Option<BoxError>,
}

fn context_suffix(phase: &Option<TransportPhase>, origin: &Option<String>) -> String {
    match (phase, origin) {
        (Some(p), Some(o)) => format!(" [{}] {}", p.as_str(), o),
        (Some(p), None) => format!(" [{}]", p.as_str()),
        (None, Some(o)) => format!(" {}", o),
        (None, None) => String::new(),
    }
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let actor = match kind {
            ErrorKind::LocalProtocolError => Some(ProtocolActor::Local),
            ErrorKind::RemoteProtocolError => Some(ProtocolActor::Remote),
            _ => None,
        };
        let phase = match kind {
            ErrorKind::ConnectTimeout | ErrorKind::ConnectError => Some(TransportPhase::Connect),
            ErrorKind::ReadTimeout | ErrorKind::ReadError => Some(TransportPhase::Read),
            ErrorKind::WriteTimeout | ErrorKind::WriteError => Some(TransportPhase::Write),
            ErrorKind::CloseError => Some(TransportPhase::Close),
            ErrorKind::PoolTimeout => Some(TransportPhase::PoolWait),
            ErrorKind::ProxyError => Some(TransportPhase::ProxyTunnel),
            _ => None,
        };
        Self {
            kind,
            phase,
            actor,
            origin: None,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectError, message)
    }

    pub fn connect_timeout(after: Duration) -> Self {
        Self::new(ErrorKind::ConnectTimeout, format!("timed out after {:?}", after))
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadError, message)
    }

    pub fn read_timeout(after: Duration) -> Self {
        Self::new(ErrorKind::ReadTimeout, format!("no data received within {:?}", after))
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WriteError, message)
    }

    pub fn write_timeout(after: Duration) -> Self {
        Self::new(ErrorKind::WriteTimeout, format!("write stalled for {:?}", after))
    }

    pub fn close(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CloseError, message)
    }

    pub fn pool_timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::PoolTimeout,
            format!("no connection available within {:?}", after),
        )
    }

    /// Protocol violation caused by this engine.
    pub fn local_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalProtocolError, message)
    }

    /// Protocol violation caused by the peer.
    pub fn remote_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteProtocolError, message)
    }

    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyError, message)
    }

    pub fn unsupported_protocol(scheme: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedProtocol,
            format!("unsupported URL scheme {:?}", scheme),
        )
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DecodingError, message)
    }

    pub fn too_many_redirects(max: usize) -> Self {
        Self::new(
            ErrorKind::TooManyRedirects,
            format!("exceeded maximum of {} redirects", max),
        )
    }

    pub fn http_status(status: u16, reason: &str, url: &str) -> Self {
        let class = if status >= 500 { "Server error" } else { "Client error" };
        let mut err = Self::new(
            ErrorKind::HttpStatusError,
            format!("{} '{} {}' for url '{}'", class, status, reason, url),
        );
        err.status = Some(status);
        err
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUrl, message)
    }

    pub fn cookie_conflict(name: &str) -> Self {
        Self::new(
            ErrorKind::CookieConflict,
            format!("multiple cookies exist with name={}", name),
        )
    }

    pub fn response_not_read() -> Self {
        Self::new(
            ErrorKind::ResponseNotRead,
            "attempted to access response content without having called read()",
        )
    }

    pub fn request_not_read() -> Self {
        Self::new(
            ErrorKind::RequestNotRead,
            "attempted to access streaming request content without having read it",
        )
    }

    pub fn stream_consumed() -> Self {
        Self::new(
            ErrorKind::StreamConsumed,
            "attempted to read or stream content, but the content has already been streamed",
        )
    }

    pub fn stream_closed() -> Self {
        Self::new(
            ErrorKind::StreamClosed,
            "attempted to read or stream content, but the stream has been closed",
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Attach the phase in which the failure happened.
    pub fn with_phase(mut self, phase: TransportPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach the origin (`scheme://host:port`) the failure relates to.
    pub fn with_origin(mut self, origin: impl fmt::Display) -> Self {
        if self.origin.is_none() {
            self.origin = Some(origin.to_string());
        }
        self
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn phase(&self) -> Option<TransportPhase> {
        self.phase
    }

    pub fn actor(&self) -> Option<ProtocolActor> {
        self.actor
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Status code carried by `HttpStatusError`.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind.is_timeout()
    }

    pub fn is_network(&self) -> bool {
        self.kind.is_network()
    }

    pub fn is_protocol(&self) -> bool {
        self.kind.is_protocol()
    }

    pub fn is_transport(&self) -> bool {
        self.kind.is_transport()
    }

    pub fn is_request_error(&self) -> bool {
        self.kind.is_request_error()
    }

    pub fn is_stream_error(&self) -> bool {
        self.kind.is_stream_error()
    }

    /// Copy of this error without its source, for fanning one connection
    /// failure out to every stream that was riding on it.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            kind: self.kind,
            phase: self.phase,
            actor: self.actor,
            origin: self.origin.clone(),
            status: self.status,
            message: self.message.clone(),
            source: None,
        }
    }
}

/// Map a socket error to the taxonomy according to the phase it happened in.
pub fn classify_io(err: io::Error, phase: TransportPhase) -> Error {
    let timed_out = err.kind() == io::ErrorKind::TimedOut;
    let kind = match phase {
        TransportPhase::Connect | TransportPhase::TlsHandshake if timed_out => {
            ErrorKind::ConnectTimeout
        }
        TransportPhase::Connect | TransportPhase::TlsHandshake => ErrorKind::ConnectError,
        TransportPhase::ProxyTunnel if timed_out => ErrorKind::ConnectTimeout,
        TransportPhase::ProxyTunnel => ErrorKind::ProxyError,
        TransportPhase::Write if timed_out => ErrorKind::WriteTimeout,
        TransportPhase::Write => ErrorKind::WriteError,
        TransportPhase::Read if timed_out => ErrorKind::ReadTimeout,
        TransportPhase::Read if err.kind() == io::ErrorKind::UnexpectedEof => {
            ErrorKind::RemoteProtocolError
        }
        TransportPhase::Read => ErrorKind::ReadError,
        TransportPhase::Close => ErrorKind::CloseError,
        TransportPhase::PoolWait => ErrorKind::PoolTimeout,
    };
    let message = if kind == ErrorKind::RemoteProtocolError {
        format!("peer closed connection mid-message: {}", err)
    } else {
        err.to_string()
    };
    Error::new(kind, message).with_phase(phase).with_source(err)
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::invalid_url(err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::decoding(format!("invalid JSON: {}", err)).with_source(err)
    }
}
