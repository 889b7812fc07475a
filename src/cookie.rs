//! RFC 6265 cookie handling.
//!
//! Cookies are keyed by `(domain, path, name)`. The client writes to the jar
//! after every hop's response headers and reads from it before every hop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use url::Url;

use crate::error::{Error, Result};

/// RFC 6265 cookie representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lower-cased domain without a leading dot.
    pub domain: String,
    pub path: String,
    /// Set when no `Domain` attribute was given: only the exact host matches.
    pub host_only: bool,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl Cookie {
    /// Host-only cookie valid for every path on `domain`.
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(&domain.into()),
            path: "/".to_string(),
            host_only: true,
            secure: false,
            http_only: false,
            same_site: None,
            expires: None,
        }
    }

    /// Parse a `Set-Cookie` value received from `request_url`.
    ///
    /// Returns `None` for cookies a user agent must ignore (no name, or a
    /// `Domain` attribute that does not cover the request host).
    pub fn parse(header: &str, request_url: &Url) -> Option<Self> {
        let host = request_url.host_str()?.to_ascii_lowercase();
        let mut parts = header.split(';');

        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim().trim_matches('"');

        let mut cookie = Cookie::new(name, value, host.as_str());
        cookie.path = default_path(request_url.path());

        let mut max_age: Option<i64> = None;
        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "domain" if !val.is_empty() => {
                    let domain = normalize_domain(val);
                    if !domain_match(&host, &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_cookie_date(val),
                "max-age" => max_age = val.parse().ok(),
                "samesite" => cookie.same_site = Some(val.to_string()),
                _ => {}
            }
        }

        // Max-Age wins over Expires.
        if let Some(secs) = max_age {
            cookie.expires = Some(if secs <= 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                Utc::now() + ChronoDuration::seconds(secs)
            });
        }
        Some(cookie)
    }

    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|t| t <= Utc::now())
    }

    /// Whether this cookie is sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        if self.secure && url.scheme() != "https" {
            return false;
        }
        if self.is_expired() {
            return false;
        }
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        domain_ok && path_match(url.path(), &self.path)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

type CookieKey = (String, String, String);

/// Cookie jar keyed by `(domain, path, name)`.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: BTreeMap<CookieKey, Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. An already-expired cookie deletes its key instead.
    pub fn insert(&mut self, cookie: Cookie) {
        let key = (cookie.domain.clone(), cookie.path.clone(), cookie.name.clone());
        if cookie.is_expired() {
            self.cookies.remove(&key);
        } else {
            self.cookies.insert(key, cookie);
        }
    }

    /// Store every `Set-Cookie` value of one response.
    pub fn store_response_cookies<'a, I>(&mut self, values: I, request_url: &Url)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for value in values {
            match Cookie::parse(value, request_url) {
                Some(cookie) => {
                    tracing::trace!(name = %cookie.name, domain = %cookie.domain, "storing cookie");
                    self.insert(cookie);
                }
                None => tracing::debug!(url = %request_url, "ignoring rejected Set-Cookie"),
            }
        }
    }

    /// Look a cookie up by name, optionally narrowed by domain and path.
    ///
    /// Fails with `CookieConflict` when several cookies match with different values.
    pub fn get(&self, name: &str, domain: Option<&str>, path: Option<&str>) -> Result<Option<&str>> {
        let domain = domain.map(normalize_domain);
        let mut found: Option<&Cookie> = None;
        for cookie in self.cookies.values().filter(|c| c.name == name) {
            if domain.as_deref().is_some_and(|d| d != cookie.domain) {
                continue;
            }
            if path.is_some_and(|p| p != cookie.path) {
                continue;
            }
            match found {
                Some(prev) if prev.value != cookie.value => return Err(Error::cookie_conflict(name)),
                _ => found = Some(cookie),
            }
        }
        Ok(found.map(|c| c.value.as_str()))
    }

    /// Set a cookie on `domain` for path `/`.
    pub fn set(&mut self, name: &str, value: &str, domain: &str) {
        self.insert(Cookie::new(name, value, domain));
    }

    /// Remove every cookie with `name`, optionally narrowed by domain.
    pub fn remove(&mut self, name: &str, domain: Option<&str>) {
        let domain = domain.map(normalize_domain);
        self.cookies.retain(|(d, _, n), _| {
            !(n == name && domain.as_deref().map_or(true, |want| want == d.as_str()))
        });
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.values()
    }

    /// Cookies to send to `url`, longest path first (RFC 6265 5.4).
    pub fn matching(&self, url: &Url) -> Vec<&Cookie> {
        let mut out: Vec<&Cookie> = self.cookies.values().filter(|c| c.matches(url)).collect();
        out.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        out
    }

    /// `Cookie` header value for `url`.
    ///
    /// A name that matches with two different values for the same request
    /// fails with `CookieConflict`; identical duplicates collapse into one.
    pub fn header_for_url(&self, url: &Url) -> Result<Option<String>> {
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for cookie in self.matching(url) {
            match seen.iter().find(|(n, _)| *n == cookie.name) {
                Some((_, v)) if *v != cookie.value => {
                    return Err(Error::cookie_conflict(&cookie.name));
                }
                Some(_) => {}
                None => seen.push((cookie.name.as_str(), cookie.value.as_str())),
            }
        }
        if seen.is_empty() {
            return Ok(None);
        }
        let pairs: Vec<String> = seen.iter().map(|(n, v)| format!("{}={}", n, v)).collect();
        Ok(Some(pairs.join("; ")))
    }
}

/// Shared, thread-safe handle to a [`CookieJar`].
///
/// Clones share the same jar, so a store handed to several clients sees
/// every client's writes.
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    inner: Arc<Mutex<CookieJar>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jar(jar: CookieJar) -> Self {
        Self {
            inner: Arc::new(Mutex::new(jar)),
        }
    }

    /// Lock the jar. A poisoned lock still yields the jar: cookie data has
    /// no invariant a panicking writer could break halfway.
    pub fn lock(&self) -> MutexGuard<'_, CookieJar> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock().get(name, None, None)?.map(str::to_string))
    }

    pub fn set(&self, name: &str, value: &str, domain: &str) {
        self.lock().set(name, value, domain);
    }

    pub fn snapshot(&self) -> CookieJar {
        self.lock().clone()
    }
}

/// Join a caller-supplied `Cookie` header with the stored one.
///
/// A name present in both with different values is a `CookieConflict`;
/// stored pairs the caller already sent verbatim are dropped.
pub(crate) fn merge_cookie_header(own: &str, stored: &str) -> Result<String> {
    fn pairs(header: &str) -> impl Iterator<Item = (&str, &str)> {
        header
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((n, v)) => (n.trim(), v.trim()),
                None => ("", p),
            })
    }

    let mut merged = own.trim().trim_end_matches(';').to_string();
    for (name, value) in pairs(stored) {
        match pairs(own).find(|(n, _)| *n == name) {
            Some((_, v)) if v != value => return Err(Error::cookie_conflict(name)),
            Some(_) => {}
            None => {
                if !merged.is_empty() {
                    merged.push_str("; ");
                }
                merged.push_str(name);
                merged.push('=');
                merged.push_str(value);
            }
        }
    }
    Ok(merged)
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// RFC 6265 5.1.3 domain matching.
fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<std::net::IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 5.1.4 path matching.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() { "/" } else { request_path };
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// RFC 6265 5.1.4 default-path.
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => request_path[..i].to_string(),
    }
}

fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    const FORMATS: [&str; 3] = [
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(value, fmt)
            .ok()
            .map(|naive| naive.and_utc())
    })
}
