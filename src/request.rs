//! Requests and the builder that sends them.

use std::time::Duration;

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::response::Response;
use crate::timeouts::Timeouts;

/// A request before the client's defaults are applied.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Headers,
    body: Bytes,
    timeouts: Timeouts,
    force_http3: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: Bytes::new(),
            timeouts: Timeouts::new(),
            force_http3: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Per-request overrides; unset slots fall back to the client's.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn force_http3(&self) -> bool {
        self.force_http3
    }

    pub(crate) fn into_parts(self) -> (Method, Url, Headers, Bytes, Timeouts, bool) {
        (
            self.method,
            self.url,
            self.headers,
            self.body,
            self.timeouts,
            self.force_http3,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Content,
    Form,
    Json,
}

/// Builder for one request on a [`Client`].
#[must_use = "a RequestBuilder does nothing until sent"]
#[derive(Debug)]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    request: Result<Request>,
    body_kind: Option<BodyKind>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: &str) -> Self {
        let request = Url::parse(url)
            .map_err(Error::from)
            .map(|url| Request::new(method, url));
        Self {
            client,
            request,
            body_kind: None,
        }
    }

    fn map(mut self, f: impl FnOnce(&mut Request) -> Result<()>) -> Self {
        if let Ok(req) = &mut self.request {
            if let Err(e) = f(req) {
                self.request = Err(e);
            }
        }
        self
    }

    fn set_body(mut self, kind: BodyKind, content_type: Option<&str>, body: Result<Bytes>) -> Self {
        if let Some(existing) = self.body_kind {
            if existing != kind {
                self.request = Err(Error::configuration(
                    "raw content, form data and JSON bodies are mutually exclusive",
                ));
                return self;
            }
        }
        self.body_kind = Some(kind);
        self.map(|req| {
            req.body = body?;
            if let Some(ct) = content_type {
                if !req.headers.contains("content-type") {
                    req.headers.insert("Content-Type", ct);
                }
            }
            Ok(())
        })
    }

    /// Append a header; several calls with one name send several fields.
    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.map(|req| {
            req.headers.append(name, value);
            Ok(())
        })
    }

    /// Headers that override the client defaults of the same name.
    pub fn headers(self, headers: Headers) -> Self {
        self.map(|req| {
            for (name, value) in headers.iter() {
                req.headers.append(name, value);
            }
            Ok(())
        })
    }

    /// Raw body bytes.
    pub fn content(self, body: impl Into<Bytes>) -> Self {
        self.set_body(BodyKind::Content, None, Ok(body.into()))
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form<K, V>(self, fields: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();
        self.set_body(
            BodyKind::Form,
            Some("application/x-www-form-urlencoded"),
            Ok(Bytes::from(encoded)),
        )
    }

    /// JSON body.
    pub fn json<T: serde::Serialize + ?Sized>(self, value: &T) -> Self {
        let body = serde_json::to_vec(value).map(Bytes::from).map_err(Error::from);
        self.set_body(BodyKind::Json, Some("application/json"), body)
    }

    /// Apply `timeout` to every phase of this request.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.timeouts(Timeouts::all(timeout))
    }

    pub fn timeouts(self, timeouts: Timeouts) -> Self {
        self.map(|req| {
            req.timeouts = timeouts;
            Ok(())
        })
    }

    /// Send over HTTP/3 only; failure to reach the origin over QUIC is an error.
    pub fn force_http3(self, force: bool) -> Self {
        self.map(|req| {
            req.force_http3 = force;
            Ok(())
        })
    }

    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Send and read the whole body.
    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        client.execute(self.request?, false).await
    }

    /// Send and return as soon as the head arrives. The body is left unread
    /// and the connection slot is held until it is read, closed or dropped.
    pub async fn send_streaming(self) -> Result<Response> {
        let client = self.client;
        client.execute(self.request?, true).await
    }
}
