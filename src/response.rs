//! HTTP response with a lazily read, read-once body.
//!
//! The body moves through [`BodyState`]: it is either materialized with
//! [`Response::read`] or iterated with [`Response::iter_chunks`] /
//! [`Response::iter_raw`], never both. Closing releases the connection slot
//! the exchange runs on; dropping the response does the same.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::decoding::{resolve_encoding, ContentDecoder};
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::transport::{Origin, ResponseHead, ResponseStream};
use crate::version::HttpVersion;

/// Consumption state of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    NotStarted,
    Streaming,
    FullyRead,
    Closed,
}

/// One followed redirect hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub status: u16,
    pub url: Url,
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: String,
    version: HttpVersion,
    headers: Headers,
    url: Url,
    origin: Origin,
    history: Vec<HistoryEntry>,
    encoding: Option<String>,
    read_timeout: Option<Duration>,
    state: BodyState,
    stream: Option<ResponseStream>,
    decoder: ContentDecoder,
    content: Option<Bytes>,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        stream: ResponseStream,
        url: Url,
        origin: Origin,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let decoder = ContentDecoder::from_headers(&head.headers)?;
        Ok(Self {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            url,
            origin,
            history: Vec::new(),
            encoding: None,
            read_timeout,
            state: BodyState::NotStarted,
            stream: Some(stream),
            decoder,
            content: None,
        })
    }

    pub(crate) fn set_history(&mut self, history: Vec<HistoryEntry>) {
        self.history = history;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// `"HTTP/1.1"`, `"HTTP/2"` or `"HTTP/3"`.
    pub fn http_version(&self) -> &'static str {
        self.version.as_str()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Final URL, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Redirect hops that led to this response, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn body_state(&self) -> BodyState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == BodyState::Closed
    }

    /// Whether the body was handed out by iteration.
    pub fn is_stream_consumed(&self) -> bool {
        matches!(self.state, BodyState::Streaming | BodyState::FullyRead) && self.content.is_none()
    }

    /// Override the charset used by [`text`](Self::text).
    pub fn set_encoding(&mut self, label: impl Into<String>) {
        self.encoding = Some(label.into());
    }

    /// Read the whole body, decode it and cache it.
    ///
    /// Calling it again returns the cached body.
    pub async fn read(&mut self) -> Result<Bytes> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        match self.state {
            BodyState::NotStarted => {}
            BodyState::Closed => return Err(Error::stream_closed()),
            BodyState::Streaming | BodyState::FullyRead => return Err(Error::stream_consumed()),
        }
        self.state = BodyState::Streaming;
        // an error or a dropped future leaves the response closed
        let mut guard = CloseOnDrop {
            response: self,
            armed: true,
        };
        let mut buf = BytesMut::new();
        while let Some(chunk) = guard.response.pull(false).await? {
            buf.extend_from_slice(&chunk);
        }
        guard.armed = false;
        let content = buf.freeze();
        guard.response.content = Some(content.clone());
        guard.response.state = BodyState::FullyRead;
        Ok(content)
    }

    /// The body read by [`read`](Self::read).
    pub fn content(&self) -> Result<&Bytes> {
        self.content.as_ref().ok_or_else(Error::response_not_read)
    }

    /// Decoded body chunks. The body can be iterated once.
    pub fn iter_chunks(&mut self) -> Result<Chunks<'_>> {
        self.start_iteration(false)
    }

    /// Body chunks as received, without undoing `Content-Encoding`.
    pub fn iter_raw(&mut self) -> Result<Chunks<'_>> {
        self.start_iteration(true)
    }

    fn start_iteration(&mut self, raw: bool) -> Result<Chunks<'_>> {
        match self.state {
            BodyState::NotStarted => {
                self.state = BodyState::Streaming;
                Ok(Chunks {
                    response: self,
                    raw,
                    done: false,
                })
            }
            BodyState::Closed => Err(Error::stream_closed()),
            BodyState::Streaming | BodyState::FullyRead => Err(Error::stream_consumed()),
        }
    }

    /// Release the underlying stream. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.state = BodyState::Closed;
    }

    /// Body decoded to text.
    ///
    /// The charset is the override from [`set_encoding`](Self::set_encoding)
    /// if any, then the `Content-Type` charset, then a BOM or valid UTF-8,
    /// then UTF-8 with replacement characters.
    pub fn text(&self) -> Result<String> {
        let content = self.content()?;
        let encoding = resolve_encoding(
            self.encoding.as_deref(),
            self.headers.get("content-type"),
            content,
            "utf-8",
        )?;
        let (text, _, _) = encoding.decode(content);
        Ok(text.into_owned())
    }

    /// Body deserialized from JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.content()?)?)
    }

    /// `HttpStatusError` for 4xx and 5xx responses.
    pub fn raise_for_status(&self) -> Result<()> {
        if (400..600).contains(&self.status) {
            return Err(Error::http_status(self.status, &self.reason, self.url.as_str()));
        }
        Ok(())
    }

    pub fn error_for_status(self) -> Result<Self> {
        self.raise_for_status()?;
        Ok(self)
    }

    async fn pull(&mut self, raw: bool) -> Result<Option<Bytes>> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            let next = stream
                .receive_chunk(self.read_timeout)
                .await
                .map_err(|e| e.with_origin(&self.origin))?;
            match next {
                Some(chunk) if raw => return Ok(Some(chunk)),
                Some(chunk) => {
                    let out = self.decoder.decode(&chunk)?;
                    if !out.is_empty() {
                        return Ok(Some(out));
                    }
                }
                None => {
                    self.stream = None;
                    if raw {
                        return Ok(None);
                    }
                    let tail = self.decoder.finish()?;
                    return Ok((!tail.is_empty()).then_some(tail));
                }
            }
        }
    }
}

struct CloseOnDrop<'a> {
    response: &'a mut Response,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.response.close();
        }
    }
}

/// Once-only iteration over a response body.
///
/// ```no_run
/// # async fn demo(mut response: guise::Response) -> guise::Result<()> {
/// let mut chunks = response.iter_chunks()?;
/// while let Some(chunk) = chunks.next().await {
///     println!("{} bytes", chunk?.len());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Chunks<'a> {
    response: &'a mut Response,
    raw: bool,
    done: bool,
}

impl Chunks<'_> {
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        if self.response.state == BodyState::Closed {
            self.done = true;
            return Some(Err(Error::stream_closed()));
        }
        match self.response.pull(self.raw).await {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                self.response.state = BodyState::FullyRead;
                None
            }
            Err(e) => {
                self.done = true;
                self.response.close();
                Some(Err(e))
            }
        }
    }

    /// Close the response mid-iteration.
    pub fn close(&mut self) {
        self.response.close();
    }
}
