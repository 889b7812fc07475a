//! Blocking facade over the async client.
//!
//! Each client owns a multi-threaded tokio runtime; requests block the
//! calling thread while the engine runs on it. Clones share the runtime,
//! the connection pool and the cookie store, so one client can serve many
//! threads. Do not call these methods from inside an async context.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::runtime::Runtime;
use url::Url;

use crate::cookie::CookieStore;
use crate::error::{Error, Result};
use crate::fingerprint::Browser;
use crate::headers::Headers;
use crate::pool::PoolStats;
use crate::request::Request;
use crate::response::{BodyState, HistoryEntry};
use crate::timeouts::Timeouts;
use crate::transport::tcp::TcpFingerprint;
use crate::version::HttpVersion;

/// Blocking HTTP client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: crate::Client,
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn get(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    pub fn trace(&self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::TRACE, url)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            runtime: &self.runtime,
            inner: self.inner.request(method, url),
        }
    }

    /// Send a prepared request.
    pub fn execute(&self, request: Request, streaming: bool) -> Result<Response> {
        let inner = self.runtime.block_on(self.inner.execute(request, streaming))?;
        Ok(Response {
            inner,
            runtime: self.runtime.clone(),
        })
    }

    pub fn cookies(&self) -> Option<&CookieStore> {
        self.inner.cookies()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }

    pub fn close_idle(&self) {
        self.inner.close_idle();
    }

    /// The async client this one drives.
    pub fn as_async(&self) -> &crate::Client {
        &self.inner
    }
}

/// Builder for the blocking [`Client`]; options match [`crate::ClientBuilder`].
#[must_use]
#[derive(Default)]
pub struct ClientBuilder {
    inner: crate::ClientBuilder,
}

macro_rules! forward {
    ($($name:ident($($arg:ident: $ty:ty),*);)*) => {
        $(
            pub fn $name(self, $($arg: $ty),*) -> Self {
                Self { inner: self.inner.$name($($arg),*) }
            }
        )*
    };
}

impl ClientBuilder {
    forward! {
        browser(browser: Browser);
        http3(enabled: bool);
        http3_fallback(enabled: bool);
        alt_svc(enabled: bool);
        timeout(timeout: Duration);
        timeouts(timeouts: Timeouts);
        verify(verify: bool);
        follow_redirects(follow: bool);
        max_redirects(max: usize);
        cookie_store(store: CookieStore);
        default_headers(headers: Headers);
        pool_max_per_host(max: usize);
        pool_idle_timeout(timeout: Duration);
        pool_max_waiters(max: usize);
        tcp_fingerprint(fingerprint: TcpFingerprint);
    }

    pub fn no_cookies(self) -> Self {
        Self {
            inner: self.inner.no_cookies(),
        }
    }

    pub fn profile(self, identifier: impl Into<String>) -> Self {
        Self {
            inner: self.inner.profile(identifier),
        }
    }

    pub fn proxy(self, proxy_url: impl Into<String>) -> Self {
        Self {
            inner: self.inner.proxy(proxy_url),
        }
    }

    pub fn root_certificate(self, cert: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: self.inner.root_certificate(cert),
        }
    }

    pub fn default_encoding(self, label: impl Into<String>) -> Self {
        Self {
            inner: self.inner.default_encoding(label),
        }
    }

    pub fn default_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            inner: self.inner.default_header(name, value),
        }
    }

    pub fn local_address(self, address: impl Into<String>) -> Self {
        Self {
            inner: self.inner.local_address(address),
        }
    }

    pub fn build(self) -> Result<Client> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("guise-blocking")
            .build()
            .map_err(|e| Error::configuration(format!("failed to start runtime: {}", e)).with_source(e))?;
        // pool housekeeping spawns onto the current runtime
        let inner = {
            let _guard = runtime.enter();
            self.inner.build()?
        };
        Ok(Client {
            inner,
            runtime: Arc::new(runtime),
        })
    }
}

/// Blocking request builder.
#[must_use = "a RequestBuilder does nothing until sent"]
#[derive(Debug)]
pub struct RequestBuilder<'a> {
    runtime: &'a Arc<Runtime>,
    inner: crate::RequestBuilder<'a>,
}

impl<'a> RequestBuilder<'a> {
    fn with(self, f: impl FnOnce(crate::RequestBuilder<'a>) -> crate::RequestBuilder<'a>) -> Self {
        Self {
            runtime: self.runtime,
            inner: f(self.inner),
        }
    }

    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(|b| b.header(name, value))
    }

    pub fn headers(self, headers: Headers) -> Self {
        self.with(|b| b.headers(headers))
    }

    pub fn content(self, body: impl Into<Bytes>) -> Self {
        self.with(|b| b.content(body))
    }

    pub fn form<K: AsRef<str>, V: AsRef<str>>(self, fields: &[(K, V)]) -> Self {
        self.with(|b| b.form(fields))
    }

    pub fn json<T: serde::Serialize + ?Sized>(self, value: &T) -> Self {
        self.with(|b| b.json(value))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.with(|b| b.timeout(timeout))
    }

    pub fn timeouts(self, timeouts: Timeouts) -> Self {
        self.with(|b| b.timeouts(timeouts))
    }

    pub fn force_http3(self, force: bool) -> Self {
        self.with(|b| b.force_http3(force))
    }

    pub fn build(self) -> Result<Request> {
        self.inner.build()
    }

    pub fn send(self) -> Result<Response> {
        let inner = self.runtime.block_on(self.inner.send())?;
        Ok(Response {
            inner,
            runtime: self.runtime.clone(),
        })
    }

    /// See [`crate::RequestBuilder::send_streaming`].
    pub fn send_streaming(self) -> Result<Response> {
        let inner = self.runtime.block_on(self.inner.send_streaming())?;
        Ok(Response {
            inner,
            runtime: self.runtime.clone(),
        })
    }
}

/// Blocking response; the body contract is that of [`crate::Response`].
#[derive(Debug)]
pub struct Response {
    inner: crate::Response,
    runtime: Arc<Runtime>,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.inner.status()
    }

    pub fn reason(&self) -> &str {
        self.inner.reason()
    }

    pub fn version(&self) -> HttpVersion {
        self.inner.version()
    }

    pub fn http_version(&self) -> &'static str {
        self.inner.http_version()
    }

    pub fn headers(&self) -> &Headers {
        self.inner.headers()
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        self.inner.history()
    }

    pub fn is_success(&self) -> bool {
        self.inner.is_success()
    }

    pub fn body_state(&self) -> BodyState {
        self.inner.body_state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn set_encoding(&mut self, label: impl Into<String>) {
        self.inner.set_encoding(label);
    }

    pub fn read(&mut self) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read())
    }

    pub fn content(&self) -> Result<&Bytes> {
        self.inner.content()
    }

    pub fn text(&self) -> Result<String> {
        self.inner.text()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.inner.json()
    }

    pub fn iter_chunks(&mut self) -> Result<Chunks<'_>> {
        let runtime = &self.runtime;
        let inner = self.inner.iter_chunks()?;
        Ok(Chunks { runtime, inner })
    }

    pub fn iter_raw(&mut self) -> Result<Chunks<'_>> {
        let runtime = &self.runtime;
        let inner = self.inner.iter_raw()?;
        Ok(Chunks { runtime, inner })
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn raise_for_status(&self) -> Result<()> {
        self.inner.raise_for_status()
    }

    pub fn error_for_status(self) -> Result<Self> {
        self.inner.raise_for_status()?;
        Ok(self)
    }

    pub fn into_async(self) -> crate::Response {
        self.inner
    }
}

/// Body chunks, read on demand.
#[derive(Debug)]
pub struct Chunks<'a> {
    runtime: &'a Runtime,
    inner: crate::response::Chunks<'a>,
}

impl Iterator for Chunks<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.inner.next())
    }
}
