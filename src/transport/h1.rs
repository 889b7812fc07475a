//! RFC 9112 HTTP/1.1 client connection.
//!
//! Requests are serialized by hand so header order and casing are exactly
//! what the caller (and the browser profile) asked for. Responses are parsed
//! with httparse and the body is streamed chunk by chunk through an explicit
//! framing state machine, so a large body never has to be buffered here.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{classify_io, Error, Result, TransportPhase};
use crate::headers::Headers;
use crate::timeouts::within;
use crate::transport::{ResponseHead, WireRequest};
use crate::version::HttpVersion;

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 8 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Byte stream a connection can run on.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

/// How the current response body is delimited (RFC 9112 section 6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked(Chunked),
    CloseDelimited,
}

/// One HTTP/1.1 connection; strictly one exchange at a time.
pub struct H1Connection {
    io: Box<dyn Io>,
    read_buf: BytesMut,
    framing: Option<Framing>,
    /// Cleared by `Connection: close`, HTTP/1.0 or close-delimited bodies.
    reusable: bool,
    /// Set from send until the body end; a dropped exchange leaves it set.
    in_flight: bool,
}

impl std::fmt::Debug for H1Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Connection")
            .field("framing", &self.framing)
            .field("reusable", &self.reusable)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl H1Connection {
    pub fn new<S: Io>(stream: S) -> Self {
        Self {
            io: Box::new(stream),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            framing: None,
            reusable: true,
            in_flight: false,
        }
    }

    /// True when the last exchange finished cleanly and the peer allows
    /// another one.
    pub fn is_reusable(&self) -> bool {
        self.reusable && !self.in_flight
    }

    /// Write the request line, headers and body.
    pub async fn send(&mut self, request: &WireRequest, write_timeout: Option<Duration>) -> Result<()> {
        if self.in_flight {
            return Err(Error::local_protocol(
                "HTTP/1.1 connection still has a response in flight",
            ));
        }
        request.headers.validate()?;
        let bytes = encode_request(request);

        self.in_flight = true;
        self.reusable = true;
        let io = &mut self.io;
        let res = within(write_timeout, Error::write_timeout, async {
            io.write_all(&bytes)
                .await
                .map_err(|e| classify_io(e, TransportPhase::Write))?;
            if !request.body.is_empty() {
                io.write_all(&request.body)
                    .await
                    .map_err(|e| classify_io(e, TransportPhase::Write))?;
            }
            io.flush()
                .await
                .map_err(|e| classify_io(e, TransportPhase::Write))
        })
        .await;
        if res.is_err() {
            self.reusable = false;
        }
        tracing::trace!(method = %request.method, target = %request.target(), "HTTP/1.1 request written");
        res
    }

    /// Read until the final response head. 1xx interim responses are skipped.
    pub async fn receive_headers(&mut self, method: &http::Method, read_timeout: Option<Duration>) -> Result<ResponseHead> {
        loop {
            let (head, http10) = loop {
                match parse_head(&self.read_buf)? {
                    Some((head, http10, len)) => {
                        self.read_buf.advance(len);
                        break (head, http10);
                    }
                    None => {
                        if self.read_buf.len() >= MAX_HEADERS_SIZE {
                            return Err(Error::remote_protocol("response headers too large"));
                        }
                        if self.fill(read_timeout).await? == 0 {
                            let msg = if self.read_buf.is_empty() {
                                "server closed the connection without sending a response"
                            } else {
                                "server closed the connection mid-headers"
                            };
                            self.reusable = false;
                            return Err(Error::remote_protocol(msg));
                        }
                    }
                }
            };

            if head.is_informational() {
                tracing::trace!(status = head.status, "skipping interim response");
                continue;
            }

            if http10 || has_token(&head.headers, "connection", "close") {
                self.reusable = false;
            }
            let framing = body_framing(method, &head)?;
            if matches!(framing, Framing::CloseDelimited) || head.status == 101 {
                self.reusable = false;
            }
            if framing == Framing::Empty {
                self.finish();
            } else {
                self.framing = Some(framing);
            }
            return Ok(head);
        }
    }

    /// Next piece of the response body, `None` once it is complete.
    pub async fn receive_chunk(&mut self, read_timeout: Option<Duration>) -> Result<Option<Bytes>> {
        loop {
            let Some(framing) = self.framing else {
                return Ok(None);
            };
            match framing {
                Framing::Empty | Framing::Length(0) => {
                    self.finish();
                    return Ok(None);
                }
                Framing::Length(remaining) => {
                    if self.read_buf.is_empty() && self.fill(read_timeout).await? == 0 {
                        return Err(self.truncated(format!(
                            "connection closed with {} body bytes outstanding",
                            remaining
                        )));
                    }
                    let n = (remaining as usize).min(self.read_buf.len());
                    self.framing = Some(Framing::Length(remaining - n as u64));
                    return Ok(Some(self.read_buf.split_to(n).freeze()));
                }
                Framing::CloseDelimited => {
                    if self.read_buf.is_empty() && self.fill(read_timeout).await? == 0 {
                        self.finish();
                        return Ok(None);
                    }
                    return Ok(Some(self.read_buf.split().freeze()));
                }
                Framing::Chunked(state) => {
                    if let Some(chunk) = self.step_chunked(state, read_timeout).await? {
                        return Ok(Some(chunk));
                    }
                }
            }
        }
    }

    /// Advance the chunked decoder by one state; returns data when a data
    /// state produced some.
    async fn step_chunked(&mut self, state: Chunked, read_timeout: Option<Duration>) -> Result<Option<Bytes>> {
        match state {
            Chunked::Size => {
                let line = self.read_line(read_timeout).await?;
                let size = parse_chunk_size(&line)?;
                let next = if size == 0 {
                    Chunked::Trailers
                } else {
                    Chunked::Data(size)
                };
                self.framing = Some(Framing::Chunked(next));
                Ok(None)
            }
            Chunked::Data(remaining) => {
                if self.read_buf.is_empty() && self.fill(read_timeout).await? == 0 {
                    return Err(self.truncated("connection closed mid-chunk"));
                }
                let n = (remaining as usize).min(self.read_buf.len());
                let left = remaining - n as u64;
                let next = if left == 0 {
                    Chunked::DataCrlf
                } else {
                    Chunked::Data(left)
                };
                self.framing = Some(Framing::Chunked(next));
                Ok(Some(self.read_buf.split_to(n).freeze()))
            }
            Chunked::DataCrlf => {
                let line = self.read_line(read_timeout).await?;
                if !line.is_empty() {
                    return Err(Error::remote_protocol("chunk data not followed by CRLF"));
                }
                self.framing = Some(Framing::Chunked(Chunked::Size));
                Ok(None)
            }
            Chunked::Trailers => {
                let line = self.read_line(read_timeout).await?;
                if line.is_empty() {
                    self.finish();
                }
                Ok(None)
            }
        }
    }

    /// One CRLF-terminated line without the terminator.
    async fn read_line(&mut self, read_timeout: Option<Duration>) -> Result<Bytes> {
        loop {
            if let Some(pos) = self.read_buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.read_buf.split_to(pos).freeze();
                self.read_buf.advance(2);
                return Ok(line);
            }
            if self.read_buf.len() > MAX_LINE {
                return Err(Error::remote_protocol("chunked framing line too long"));
            }
            if self.fill(read_timeout).await? == 0 {
                return Err(self.truncated("connection closed inside chunked framing"));
            }
        }
    }

    /// Read more bytes into the buffer; 0 means EOF. Each read gets the full
    /// read budget.
    async fn fill(&mut self, read_timeout: Option<Duration>) -> Result<usize> {
        self.read_buf.reserve(READ_CHUNK);
        let io = &mut self.io;
        let buf = &mut self.read_buf;
        within(read_timeout, Error::read_timeout, async {
            io.read_buf(buf)
                .await
                .map_err(|e| classify_io(e, TransportPhase::Read))
        })
        .await
    }

    fn truncated(&mut self, msg: impl Into<String>) -> Error {
        self.reusable = false;
        Error::remote_protocol(msg)
    }

    fn finish(&mut self) {
        self.framing = None;
        self.in_flight = false;
    }

    /// Non-blocking check whether an idle connection was closed by the peer
    /// (or sent something unsolicited). Either way it must not be reused.
    pub async fn is_stale(&mut self) -> bool {
        if !self.is_reusable() {
            return true;
        }
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, self.io.read(&mut probe)).await {
            Err(_) => false,
            Ok(_) => {
                self.reusable = false;
                true
            }
        }
    }
}

fn encode_request(request: &WireRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(512 + request.headers.len() * 32);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    // Host goes first (RFC 9112 section 3.2 recommends it, browsers do it)
    let host = request
        .headers
        .get("host")
        .map(str::to_string)
        .unwrap_or_else(|| request.origin.authority());
    push_header(&mut out, "Host", &host);
    if !request.headers.contains("connection") {
        push_header(&mut out, "Connection", "keep-alive");
    }

    let needs_length = !request.body.is_empty()
        || matches!(
            request.method,
            http::Method::POST | http::Method::PUT | http::Method::PATCH
        );
    if needs_length
        && !request.headers.contains("content-length")
        && !request.headers.contains("transfer-encoding")
    {
        push_header(&mut out, "Content-Length", &request.body.len().to_string());
    }

    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        push_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Parse a status line and headers. `Ok(None)` when more bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, bool, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(Error::remote_protocol(format!("malformed response head: {}", e)));
        }
    };
    let status = response
        .code
        .ok_or_else(|| Error::remote_protocol("missing status code"))?;
    let http10 = response.version == Some(0);
    let reason = match response.reason {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => crate::transport::canonical_reason(status).to_string(),
    };
    let headers: Headers = response
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    Ok(Some((
        ResponseHead {
            status,
            reason,
            version: HttpVersion::Http1_1,
            headers,
        },
        http10,
        len,
    )))
}

fn body_framing(method: &http::Method, head: &ResponseHead) -> Result<Framing> {
    if *method == http::Method::HEAD || matches!(head.status, 100..=199 | 204 | 304) {
        return Ok(Framing::Empty);
    }
    if let Some(te) = head.headers.get("transfer-encoding") {
        // chunked must be the final coding; Content-Length is ignored
        let chunked = te
            .rsplit(',')
            .next()
            .is_some_and(|c| c.trim().eq_ignore_ascii_case("chunked"));
        return Ok(if chunked {
            Framing::Chunked(Chunked::Size)
        } else {
            Framing::CloseDelimited
        });
    }
    let mut length = None;
    for value in head.headers.get_all("content-length") {
        let n = parse_content_length(value)?;
        if length.is_some_and(|l| l != n) {
            return Err(Error::remote_protocol(format!(
                "conflicting Content-Length values: {}",
                value
            )));
        }
        length = Some(n);
    }
    Ok(match length {
        Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
        None => Framing::CloseDelimited,
    })
}

/// Content-Length; comma-separated duplicates must agree (RFC 9112 6.3).
fn parse_content_length(value: &str) -> Result<u64> {
    let mut result = None;
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::remote_protocol(format!("invalid Content-Length: {:?}", value)));
        }
        let n: u64 = part
            .parse()
            .map_err(|_| Error::remote_protocol(format!("invalid Content-Length: {:?}", value)))?;
        if result.is_some_and(|r| r != n) {
            return Err(Error::remote_protocol(format!(
                "conflicting Content-Length values: {}",
                value
            )));
        }
        result = Some(n);
    }
    result.ok_or_else(|| Error::remote_protocol("empty Content-Length"))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::remote_protocol("non-ASCII chunk size line"))?;
    // chunk extensions after ';' are ignored
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() || size.len() > 16 {
        return Err(Error::remote_protocol(format!("invalid chunk size {:?}", line)));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| Error::remote_protocol(format!("invalid chunk size {:?}", line)))
}

fn has_token(headers: &Headers, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use url::Url;

    fn get(url: &str, headers: Headers) -> WireRequest {
        WireRequest::new(http::Method::GET, &Url::parse(url).unwrap(), headers, Bytes::new()).unwrap()
    }

    async fn exchange(raw: &'static [u8]) -> (H1Connection, DuplexStream) {
        let (client, mut server) = duplex(64 * 1024);
        let mut conn = H1Connection::new(client);
        conn.send(&get("http://example.com/", Headers::new()), None).await.unwrap();
        server.write_all(raw).await.unwrap();
        (conn, server)
    }

    async fn read_body(conn: &mut H1Connection) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = conn.receive_chunk(None).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    #[test]
    fn test_request_encoding_order() {
        let headers: Headers = [("User-Agent", "ua"), ("accept", "*/*")].into_iter().collect();
        let req = get("http://example.com:8080/a?b=1", headers);
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert_eq!(
            text,
            "GET /a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\nConnection: keep-alive\r\nUser-Agent: ua\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_post_gets_content_length() {
        let url = Url::parse("http://example.com/").unwrap();
        let req = WireRequest::new(http::Method::POST, &url, Headers::new(), Bytes::from_static(b"abc")).unwrap();
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let (mut conn, _server) =
            exchange(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let head = conn.receive_headers(&http::Method::GET, None).await.unwrap();
        assert_eq!((head.status, head.reason.as_str()), (200, "OK"));
        assert_eq!(read_body(&mut conn).await.unwrap(), b"hello");
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_chunked_body_with_trailers_and_interim() {
        let (mut conn, _server) = exchange(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              3;ext=1\r\nabc\r\nA\r\n0123456789\r\n0\r\nX-Trailer: t\r\n\r\n",
        )
        .await;
        let head = conn.receive_headers(&http::Method::GET, None).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(read_body(&mut conn).await.unwrap(), b"abc0123456789");
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_close_delimited_body() {
        let (mut conn, server) = exchange(b"HTTP/1.1 200 OK\r\n\r\nuntil close").await;
        drop(server);
        conn.receive_headers(&http::Method::GET, None).await.unwrap();
        assert_eq!(read_body(&mut conn).await.unwrap(), b"until close");
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let (mut conn, _server) =
            exchange(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").await;
        conn.receive_headers(&http::Method::HEAD, None).await.unwrap();
        assert!(conn.receive_chunk(None).await.unwrap().is_none());
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_truncated_body_is_remote_error() {
        let (mut conn, server) =
            exchange(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
        drop(server);
        conn.receive_headers(&http::Method::GET, None).await.unwrap();
        let err = read_body(&mut conn).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteProtocolError);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_connection_close_not_reusable() {
        let (mut conn, _server) =
            exchange(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        conn.receive_headers(&http::Method::GET, None).await.unwrap();
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_malformed_status_line() {
        let (mut conn, _server) = exchange(b"HTTP/1.1 abc OK\r\n\r\n").await;
        let err = conn.receive_headers(&http::Method::GET, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RemoteProtocolError);
    }

    #[tokio::test]
    async fn test_read_timeout_leaves_connection_unusable() {
        let (client, _server) = duplex(1024);
        let mut conn = H1Connection::new(client);
        conn.send(&get("http://example.com/", Headers::new()), None).await.unwrap();
        let err = conn
            .receive_headers(&http::Method::GET, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ReadTimeout);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_second_send_while_in_flight_is_local_error() {
        let (client, _server) = duplex(1024);
        let mut conn = H1Connection::new(client);
        let req = get("http://example.com/", Headers::new());
        conn.send(&req, None).await.unwrap();
        let err = conn.send(&req, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::LocalProtocolError);
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let (mut conn, server) = exchange(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        conn.receive_headers(&http::Method::GET, None).await.unwrap();
        assert!(!conn.is_stale().await);
        drop(server);
        assert!(conn.is_stale().await);
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("42").unwrap(), 42);
        assert_eq!(parse_content_length("7, 7").unwrap(), 7);
        assert!(parse_content_length("7, 8").is_err());
        assert!(parse_content_length("-1").is_err());
        assert!(parse_content_length("+1").is_err());
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1F").unwrap(), 31);
        assert_eq!(parse_chunk_size(b"a;name=value").unwrap(), 10);
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"zz").is_err());
    }
}
