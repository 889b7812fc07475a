//! Connection establishment and the per-protocol drivers.
//!
//! - TCP (+ optional proxy tunnel) + BoringSSL for HTTP/1.1 and HTTP/2
//! - QUIC via quiche for HTTP/3
//!
//! Every driver exposes the same four operations: send a request, receive the
//! response head, receive body chunks, close the stream. [`ResponseStream`]
//! unifies them and owns the pool lease the exchange runs on.

pub mod connector;
pub mod h1;
pub mod h2;
pub mod h3;
pub mod tcp;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::PseudoHeader;
use crate::headers::{is_connection_specific, Headers};
use crate::pool::Lease;
use connector::Connection;
use crate::version::HttpVersion;

/// Scheme, host and port of one server endpoint; the pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Fails with `UnsupportedProtocol` for schemes other than http/https and
    /// with `InvalidUrl` when there is no host.
    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(Error::unsupported_protocol(scheme));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_url(format!("URL has no host: {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_url(format!("URL has no port: {}", url)))?;
        // host_str keeps IPv6 brackets; store the bare address
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host without IPv6 brackets, as used for DNS and SNI.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    fn default_port(&self) -> u16 {
        if self.is_https() {
            443
        } else {
            80
        }
    }

    fn host_for_authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `Host` / `:authority` value: the port is omitted when it is the
    /// scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.default_port() {
            self.host_for_authority()
        } else {
            format!("{}:{}", self.host_for_authority(), self.port)
        }
    }

    /// `host:port` with the port always present, as used by CONNECT.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host_for_authority(), self.port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_port())
    }
}

/// A request as the drivers put it on the wire.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: http::Method,
    pub origin: Origin,
    /// Path and query, always starting with `/`.
    pub path: String,
    /// Send the request target in absolute-form (plain HTTP via proxy).
    pub absolute_form: bool,
    /// Ordered headers, excluding `Host`.
    pub headers: Headers,
    pub body: Bytes,
}

impl WireRequest {
    pub fn new(method: http::Method, url: &Url, headers: Headers, body: Bytes) -> Result<Self> {
        let origin = Origin::from_url(url)?;
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            method,
            origin,
            path,
            absolute_form: false,
            headers,
            body,
        })
    }

    /// Request target for HTTP/1.1.
    pub fn target(&self) -> String {
        if self.absolute_form {
            format!("{}://{}{}", self.origin.scheme(), self.origin.authority(), self.path)
        } else {
            self.path.clone()
        }
    }

    /// Field list for HTTP/2 and HTTP/3: pseudo-headers in `order`, then the
    /// regular headers lowercased, without connection-specific fields.
    pub(crate) fn multiplexed_fields(&self, order: &[PseudoHeader; 4]) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.headers.len() + 4);
        for pseudo in order {
            let value = match pseudo {
                PseudoHeader::Method => self.method.as_str().to_string(),
                PseudoHeader::Authority => self.origin.authority(),
                PseudoHeader::Scheme => self.origin.scheme().to_string(),
                PseudoHeader::Path => self.path.clone(),
            };
            fields.push((pseudo.name().to_string(), value));
        }
        for (name, value) in self.headers.iter() {
            if is_connection_specific(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            // TE is only allowed with "trailers" (RFC 9113 8.2.2)
            if name.eq_ignore_ascii_case("te") && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
            fields.push((name.to_ascii_lowercase(), value.to_string()));
        }
        fields
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

impl ResponseHead {
    /// Build a head from a decoded HTTP/2 or HTTP/3 field list.
    pub(crate) fn from_fields(fields: Vec<(String, String)>, version: HttpVersion) -> Result<Self> {
        let mut status = None;
        let mut headers = Headers::new();
        for (name, value) in fields {
            if name == ":status" {
                let code = value
                    .parse::<u16>()
                    .ok()
                    .filter(|c| (100..1000).contains(c))
                    .ok_or_else(|| Error::remote_protocol(format!("invalid :status {:?}", value)))?;
                status = Some(code);
            } else if name.starts_with(':') {
                return Err(Error::remote_protocol(format!(
                    "unexpected pseudo-header {} in response",
                    name
                )));
            } else {
                headers.append(name, value);
            }
        }
        let status = status.ok_or_else(|| Error::remote_protocol("response without :status"))?;
        Ok(Self {
            status,
            reason: canonical_reason(status).to_string(),
            version,
            headers,
        })
    }

    /// 1xx other than 101 are skipped by every driver.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

pub(crate) fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Body events flowing from a multiplexing driver task to its stream.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    Data(Bytes),
    End,
    Error(Error),
}

enum Driver {
    H1,
    H2(h2::H2Stream),
    H3(h3::H3Stream),
}

/// One request/response exchange on a leased connection.
///
/// The lease goes back to the pool once the body has been read to the end.
/// Closing or dropping the stream earlier resets a multiplexed stream, or
/// tears down an HTTP/1.1 connection whose response was not fully read.
pub struct ResponseStream {
    lease: Option<Lease>,
    driver: Driver,
    version: HttpVersion,
    finished: bool,
}

impl ResponseStream {
    /// Write `request` on the leased connection.
    pub async fn send(mut lease: Lease, request: &WireRequest, write_timeout: Option<Duration>) -> Result<Self> {
        let version = lease.version();
        let driver = match lease.conn_mut() {
            None => return Err(Error::stream_closed()),
            Some(Connection::H1(conn)) => {
                if let Err(e) = conn.send(request, write_timeout).await {
                    lease.discard();
                    return Err(e);
                }
                Driver::H1
            }
            Some(Connection::H2(handle)) => match handle.send(request) {
                Ok(stream) => Driver::H2(stream),
                Err(e) => {
                    lease.release();
                    return Err(e);
                }
            },
            Some(Connection::H3(handle)) => match handle.send(request) {
                Ok(stream) => Driver::H3(stream),
                Err(e) => {
                    lease.release();
                    return Err(e);
                }
            },
        };
        Ok(Self {
            lease: Some(lease),
            driver,
            version,
            finished: false,
        })
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// Wait for the final (non-1xx) response head.
    pub async fn receive_headers(&mut self, method: &http::Method, read_timeout: Option<Duration>) -> Result<ResponseHead> {
        let res = match &mut self.driver {
            Driver::H1 => match self.lease.as_mut().and_then(Lease::conn_mut) {
                Some(Connection::H1(conn)) => conn.receive_headers(method, read_timeout).await,
                _ => Err(Error::stream_closed()),
            },
            Driver::H2(stream) => stream.receive_headers(read_timeout).await,
            Driver::H3(stream) => stream.receive_headers(read_timeout).await,
        };
        if res.is_err() {
            self.abort();
        }
        res
    }

    /// Next body chunk, `None` at the end of the body.
    pub async fn receive_chunk(&mut self, read_timeout: Option<Duration>) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        let res = match &mut self.driver {
            Driver::H1 => match self.lease.as_mut().and_then(Lease::conn_mut) {
                Some(Connection::H1(conn)) => conn.receive_chunk(read_timeout).await,
                _ => Err(Error::stream_closed()),
            },
            Driver::H2(stream) => stream.receive_chunk(read_timeout).await,
            Driver::H3(stream) => stream.receive_chunk(read_timeout).await,
        };
        match res {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.complete();
                Ok(None)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Stop the exchange. Idempotent.
    pub fn close(&mut self) {
        if !self.finished {
            self.abort();
        }
    }

    fn complete(&mut self) {
        self.finished = true;
        if let Some(mut lease) = self.lease.take() {
            let reusable = match lease.conn_mut() {
                Some(Connection::H1(conn)) => conn.is_reusable(),
                _ => true,
            };
            if reusable {
                lease.release();
            } else {
                lease.discard();
            }
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        match &mut self.driver {
            Driver::H1 => {
                // mid-message HTTP/1.1 state cannot be recovered
                if let Some(lease) = self.lease.take() {
                    lease.discard();
                }
            }
            Driver::H2(stream) => {
                stream.close();
                if let Some(lease) = self.lease.take() {
                    lease.release();
                }
            }
            Driver::H3(stream) => {
                stream.close();
                if let Some(lease) = self.lease.take() {
                    lease.release();
                }
            }
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("version", &self.version)
            .field("finished", &self.finished)
            .finish()
    }
}
