//! The client and its request pipeline.
//!
//! Per request: resolve the timeout budget, inject cookies, order headers
//! the way the profile's browser does, lease a connection, send, read the
//! head, store cookies, and follow redirects until a final response.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::cookie::{merge_cookie_header, CookieStore};
use crate::error::{Error, ErrorKind, Result};
use crate::fingerprint::{build_tls_config, Browser, BrowserProfile};
use crate::headers::Headers;
use crate::pool::alt_svc::AltSvcCache;
use crate::pool::{ConnectionPool, Lease, PoolConfig, PoolKey, PoolStats, Transport};
use crate::request::{Request, RequestBuilder};
use crate::response::{HistoryEntry, Response};
use crate::timeouts::Timeouts;
use crate::transport::connector::{Connector, Proxy};
use crate::transport::tcp::TcpFingerprint;
use crate::transport::{Origin, ResponseStream, WireRequest};
use crate::version::HttpVersion;

/// Redirects followed before `TooManyRedirects`.
pub const DEFAULT_MAX_REDIRECTS: usize = 20;

/// How one hop reaches its origin.
enum Route {
    Tcp,
    /// HTTP/3 was asked for; failing is an error unless `fallback` is set.
    Quic { origin: Origin, fallback: bool },
    /// HTTP/3 learned from `Alt-Svc`; failing falls back to TCP.
    AltSvc(Origin),
}

#[derive(Debug)]
struct ClientRef {
    profile: &'static BrowserProfile,
    connector: Connector,
    pool: Arc<ConnectionPool>,
    alt_svc: Option<AltSvcCache>,
    cookies: Option<CookieStore>,
    headers: Headers,
    timeouts: Timeouts,
    http3: bool,
    http3_fallback: bool,
    follow_redirects: bool,
    max_redirects: usize,
    default_encoding: Option<String>,
}

/// HTTP client that looks like one browser on the wire.
///
/// Cloning is cheap; clones share the connection pool and cookie store.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl Client {
    /// Client with the default profile and settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
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
        RequestBuilder::new(self, method, url)
    }

    pub fn profile(&self) -> &'static BrowserProfile {
        self.inner.profile
    }

    /// The cookie store, unless cookies are disabled.
    pub fn cookies(&self) -> Option<&CookieStore> {
        self.inner.cookies.as_ref()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Close every idle pooled connection.
    pub fn close_idle(&self) {
        self.inner.pool.close_idle();
    }

    /// Send `request`. With `streaming` the body is left unread.
    pub async fn execute(&self, request: Request, streaming: bool) -> Result<Response> {
        let (method, url, headers, body, overrides, force_http3) = request.into_parts();
        let timeouts = Timeouts::resolve(&overrides, &self.inner.timeouts);
        let mut response = self
            .follow(method, url, headers, body, &timeouts, force_http3)
            .await?;
        if !streaming {
            response.read().await?;
        }
        Ok(response)
    }

    async fn follow(
        &self,
        mut method: Method,
        mut url: Url,
        mut headers: Headers,
        mut body: Bytes,
        timeouts: &Timeouts,
        force_http3: bool,
    ) -> Result<Response> {
        let mut history = Vec::new();
        loop {
            let mut response = self
                .send_hop(&method, &url, &headers, &body, timeouts, force_http3)
                .await?;

            let location = match response.headers().get("location") {
                Some(loc) if self.inner.follow_redirects && is_followed(response.status()) => {
                    loc.to_string()
                }
                _ => {
                    response.set_history(history);
                    return Ok(response);
                }
            };
            let status = response.status();
            if history.len() >= self.inner.max_redirects {
                response.close();
                return Err(Error::too_many_redirects(self.inner.max_redirects)
                    .with_origin(Origin::from_url(&url)?));
            }
            let next = url.join(&location)?;
            // drain so the connection goes back to the pool
            response.read().await?;
            drop(response);

            tracing::debug!(status, from = %url, to = %next, "following redirect");
            if rewrites_to_get(status, &method) {
                method = Method::GET;
                body = Bytes::new();
                headers.remove("content-type");
                headers.remove("content-length");
                headers.remove("transfer-encoding");
            }
            if Origin::from_url(&url)? != Origin::from_url(&next)? {
                headers.remove("authorization");
                headers.remove("cookie");
            }
            history.push(HistoryEntry {
                status,
                url: std::mem::replace(&mut url, next),
            });
        }
    }

    /// One request/response exchange; the body is not read.
    async fn send_hop(
        &self,
        method: &Method,
        url: &Url,
        headers: &Headers,
        body: &Bytes,
        timeouts: &Timeouts,
        force_http3: bool,
    ) -> Result<Response> {
        let inner = &*self.inner;
        let origin = Origin::from_url(url)?;
        let route = self.route(&origin, force_http3)?;

        let mut wire_headers = headers.clone();
        wire_headers.merge_defaults(&inner.headers);
        if let Some(store) = &inner.cookies {
            if let Some(stored) = store.lock().header_for_url(url)? {
                let value = match wire_headers.get("cookie") {
                    Some(own) => merge_cookie_header(own, &stored)?,
                    None => stored,
                };
                wire_headers.insert("Cookie", value);
            }
        }
        if !body.is_empty() && !wire_headers.contains("content-length") {
            wire_headers.insert("Content-Length", body.len().to_string());
        }
        wire_headers.apply_order(inner.profile.header_order);
        wire_headers.validate()?;

        let lease = self.lease(&origin, route, timeouts).await?;
        let mut wire = WireRequest::new(method.clone(), url, wire_headers, body.clone())?;
        if lease.key().transport == Transport::Tcp {
            wire.absolute_form = inner.connector.uses_absolute_form(&origin);
            if let Some(auth) = inner.connector.proxy_authorization(&origin) {
                wire.headers.insert("Proxy-Authorization", auth);
            }
        }

        let mut stream = ResponseStream::send(lease, &wire, timeouts.write)
            .await
            .map_err(|e| e.with_origin(&origin))?;
        let head = stream
            .receive_headers(method, timeouts.read)
            .await
            .map_err(|e| e.with_origin(&origin))?;
        tracing::debug!(
            %method,
            %url,
            status = head.status,
            version = %head.version,
            "received response head"
        );

        if let Some(store) = &inner.cookies {
            store
                .lock()
                .store_response_cookies(head.headers.get_all("set-cookie"), url);
        }
        if let Some(cache) = &inner.alt_svc {
            if origin.is_https() && head.version != HttpVersion::Http3 {
                if let Some(value) = head.headers.get("alt-svc") {
                    cache.update(&origin, value);
                }
            }
        }

        let mut response = Response::new(head, stream, url.clone(), origin, timeouts.read)?;
        if let Some(label) = &inner.default_encoding {
            response.set_encoding(label.clone());
        }
        Ok(response)
    }

    fn route(&self, origin: &Origin, force_http3: bool) -> Result<Route> {
        let inner = &*self.inner;
        if force_http3 {
            if !origin.is_https() {
                return Err(Error::new(
                    ErrorKind::UnsupportedProtocol,
                    "HTTP/3 requires an https URL",
                )
                .with_origin(origin));
            }
            return Ok(Route::Quic {
                origin: origin.clone(),
                fallback: false,
            });
        }
        if inner.http3 && origin.is_https() {
            return Ok(Route::Quic {
                origin: origin.clone(),
                fallback: inner.http3_fallback,
            });
        }
        if let Some(alt) = inner.alt_svc.as_ref().and_then(|c| c.h3_origin(origin)) {
            return Ok(Route::AltSvc(alt));
        }
        Ok(Route::Tcp)
    }

    async fn lease(&self, origin: &Origin, route: Route, timeouts: &Timeouts) -> Result<Lease> {
        let inner = &*self.inner;
        let (quic_origin, fallback) = match route {
            Route::Tcp => return self.lease_tcp(origin, timeouts).await,
            Route::Quic { origin, fallback } => (origin, fallback),
            Route::AltSvc(origin) => (origin, true),
        };
        match self.lease_quic(&quic_origin, timeouts).await {
            Ok(lease) => Ok(lease),
            Err(e) if fallback && e.is_transport() && e.kind() != ErrorKind::PoolTimeout => {
                if let Some(cache) = &inner.alt_svc {
                    cache.forget(origin);
                }
                tracing::warn!(%origin, error = %e, "HTTP/3 failed, falling back to TCP");
                self.lease_tcp(origin, timeouts).await
            }
            Err(e) => Err(e),
        }
    }

    async fn lease_tcp(&self, origin: &Origin, timeouts: &Timeouts) -> Result<Lease> {
        let connector = &self.inner.connector;
        let key = PoolKey::new(origin.clone(), Transport::Tcp);
        self.inner
            .pool
            .acquire(&key, timeouts.pool, move || connector.connect(origin, timeouts))
            .await
            .map_err(|e| e.with_origin(origin))
    }

    async fn lease_quic(&self, origin: &Origin, timeouts: &Timeouts) -> Result<Lease> {
        let connector = &self.inner.connector;
        let key = PoolKey::new(origin.clone(), Transport::Quic);
        self.inner
            .pool
            .acquire(&key, timeouts.pool, move || connector.connect_quic(origin, timeouts))
            .await
            .map_err(|e| e.with_origin(origin))
    }
}

fn is_followed(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// 301/302/303 turn everything but GET and HEAD into a bodiless GET.
fn rewrites_to_get(status: u16, method: &Method) -> bool {
    matches!(status, 301 | 302 | 303) && *method != Method::GET && *method != Method::HEAD
}

enum ProfileChoice {
    Browser(Browser),
    Named(String),
}

/// Builder for [`Client`].
#[must_use]
pub struct ClientBuilder {
    profile: ProfileChoice,
    http3: bool,
    http3_fallback: bool,
    alt_svc: bool,
    proxy: Option<String>,
    timeouts: Timeouts,
    verify: bool,
    roots: Vec<Vec<u8>>,
    default_encoding: Option<String>,
    follow_redirects: bool,
    max_redirects: usize,
    cookies_enabled: bool,
    cookie_store: Option<CookieStore>,
    default_headers: Headers,
    local_address: Option<String>,
    pool: PoolConfig,
    tcp_fingerprint: Option<TcpFingerprint>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            profile: ProfileChoice::Browser(Browser::default()),
            http3: false,
            http3_fallback: false,
            alt_svc: false,
            proxy: None,
            timeouts: Timeouts::api_defaults(),
            verify: true,
            roots: Vec::new(),
            default_encoding: None,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cookies_enabled: true,
            cookie_store: None,
            default_headers: Headers::new(),
            local_address: None,
            pool: PoolConfig::default(),
            tcp_fingerprint: None,
        }
    }

    pub fn browser(mut self, browser: Browser) -> Self {
        self.profile = ProfileChoice::Browser(browser);
        self
    }

    /// Profile by identifier, e.g. `"chrome131"` or `"firefox"`.
    pub fn profile(mut self, identifier: impl Into<String>) -> Self {
        self.profile = ProfileChoice::Named(identifier.into());
        self
    }

    /// Send every https request over HTTP/3.
    pub fn http3(mut self, enabled: bool) -> Self {
        self.http3 = enabled;
        self
    }

    /// When HTTP/3 is enabled, retry over TCP if the QUIC connection fails.
    /// Off by default: a failed QUIC attempt is reported, not hidden.
    pub fn http3_fallback(mut self, enabled: bool) -> Self {
        self.http3_fallback = enabled;
        self
    }

    /// Switch to HTTP/3 for origins that advertise it via `Alt-Svc`.
    pub fn alt_svc(mut self, enabled: bool) -> Self {
        self.alt_svc = enabled;
        self
    }

    /// `http://[user:pass@]host:port`
    pub fn proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    /// The same timeout for every phase.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeouts = Timeouts::all(timeout);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Certificate verification; turning it off leaves the ClientHello as is.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Trust an extra root, PEM or DER.
    pub fn root_certificate(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.roots.push(cert.into());
        self
    }

    /// Charset for `Response::text`, ahead of any declared charset.
    pub fn default_encoding(mut self, label: impl Into<String>) -> Self {
        self.default_encoding = Some(label.into());
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Share `store` with this client.
    pub fn cookie_store(mut self, store: CookieStore) -> Self {
        self.cookie_store = Some(store);
        self.cookies_enabled = true;
        self
    }

    /// Neither send nor store cookies.
    pub fn no_cookies(mut self) -> Self {
        self.cookies_enabled = false;
        self.cookie_store = None;
        self
    }

    /// Headers sent with every request, over the profile's own.
    pub fn default_headers(mut self, headers: Headers) -> Self {
        for (name, value) in headers.iter() {
            self.default_headers.insert(name, value);
        }
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Bind outgoing sockets to this IPv4 or IPv6 address.
    pub fn local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    pub fn pool_max_per_host(mut self, max: usize) -> Self {
        self.pool.max_per_host = max;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    pub fn pool_max_waiters(mut self, max: usize) -> Self {
        self.pool.max_waiters = max;
        self
    }

    /// Socket options to use instead of the profile's.
    pub fn tcp_fingerprint(mut self, fingerprint: TcpFingerprint) -> Self {
        self.tcp_fingerprint = Some(fingerprint);
        self
    }

    pub fn build(self) -> Result<Client> {
        let browser = match &self.profile {
            ProfileChoice::Browser(b) => *b,
            ProfileChoice::Named(id) => id.parse()?,
        };
        let profile = browser.profile();
        if self.pool.max_per_host == 0 {
            return Err(Error::configuration("pool_max_per_host must be at least 1"));
        }
        let proxy = self.proxy.as_deref().map(Proxy::parse).transpose()?;
        let local_address = self
            .local_address
            .as_deref()
            .map(|addr| {
                addr.trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<IpAddr>()
                    .map_err(|_| Error::configuration(format!("invalid local address {:?}", addr)))
            })
            .transpose()?;

        let tls = build_tls_config(profile, self.verify, &self.roots)?;
        let tcp_fingerprint = Some(self.tcp_fingerprint.unwrap_or(profile.tcp));
        let connector = Connector::new(tls, profile, self.roots, proxy, local_address, tcp_fingerprint);

        let mut headers: Headers = profile.headers.iter().copied().collect();
        for (name, value) in self.default_headers.iter() {
            headers.insert(name, value);
        }

        let cookies = if self.cookies_enabled {
            Some(self.cookie_store.unwrap_or_default())
        } else {
            None
        };

        tracing::debug!(profile = %browser, http3 = self.http3, "client built");
        Ok(Client {
            inner: Arc::new(ClientRef {
                profile,
                connector,
                pool: ConnectionPool::new(self.pool),
                alt_svc: self.alt_svc.then(AltSvcCache::new),
                cookies,
                headers,
                timeouts: self.timeouts,
                http3: self.http3,
                http3_fallback: self.http3_fallback,
                follow_redirects: self.follow_redirects,
                max_redirects: self.max_redirects,
                default_encoding: self.default_encoding,
            }),
        })
    }
}
