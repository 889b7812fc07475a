//! Alt-Svc (RFC 7838) cache used to discover HTTP/3 endpoints.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::transport::Origin;

/// `ma` when the advertisement carries none (RFC 7838 section 3.1).
const DEFAULT_MAX_AGE: u64 = 86_400;

/// One alternative service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvc {
    /// ALPN id, e.g. `h3`, `h3-29`.
    pub protocol: String,
    /// `None` means the origin's own host.
    pub host: Option<String>,
    pub port: u16,
    pub max_age: Duration,
}

impl AltSvc {
    pub fn is_h3(&self) -> bool {
        self.protocol == "h3"
    }
}

/// What a header value asks of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltSvcDirective {
    Clear,
    Advertise(Vec<AltSvc>),
}

/// Parse an `Alt-Svc` header value. Malformed alternatives are skipped.
pub fn parse_alt_svc(value: &str) -> AltSvcDirective {
    if value.trim().eq_ignore_ascii_case("clear") {
        return AltSvcDirective::Clear;
    }
    let alternatives = value
        .split(',')
        .filter_map(|alt| {
            let mut parts = alt.split(';');
            let (protocol, authority) = parts.next()?.trim().split_once('=')?;
            let protocol = protocol.trim();
            if protocol.is_empty() {
                return None;
            }
            let (host, port) = parse_authority(authority)?;
            let mut max_age = DEFAULT_MAX_AGE;
            for param in parts {
                if let Some((key, val)) = param.trim().split_once('=') {
                    if key.trim() == "ma" {
                        max_age = val.trim().trim_matches('"').parse().ok()?;
                    }
                }
            }
            Some(AltSvc {
                protocol: protocol.to_string(),
                host,
                port,
                max_age: Duration::from_secs(max_age),
            })
        })
        .collect();
    AltSvcDirective::Advertise(alternatives)
}

/// `":443"`, `"alt.example.com:443"`; quotes are optional.
fn parse_authority(raw: &str) -> Option<(Option<String>, u16)> {
    let raw = raw.trim().trim_matches('"');
    let (host, port) = raw.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some(((!host.is_empty()).then(|| host.to_string()), port))
}

#[derive(Debug)]
struct Cached {
    port: u16,
    expires: Instant,
}

/// HTTP/3 endpoints learned per origin.
#[derive(Debug, Default)]
pub struct AltSvcCache {
    entries: Mutex<HashMap<Origin, Cached>>,
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an `Alt-Svc` header received from `origin`. Only same-host
    /// `h3` alternatives are kept; a different host would need its own
    /// certificate check.
    pub fn update(&self, origin: &Origin, header: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match parse_alt_svc(header) {
            AltSvcDirective::Clear => {
                entries.remove(origin);
            }
            AltSvcDirective::Advertise(alts) => {
                let usable = alts.into_iter().find(|a| {
                    a.is_h3() && a.host.as_deref().map_or(true, |h| h.eq_ignore_ascii_case(origin.host()))
                });
                if let Some(alt) = usable {
                    tracing::debug!(%origin, port = alt.port, "learned HTTP/3 endpoint");
                    entries.insert(
                        origin.clone(),
                        Cached {
                            port: alt.port,
                            expires: Instant::now() + alt.max_age,
                        },
                    );
                }
            }
        }
    }

    /// QUIC origin to use instead of `origin`, if one is advertised and fresh.
    pub fn h3_origin(&self, origin: &Origin) -> Option<Origin> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(origin) {
            Some(cached) if cached.expires > Instant::now() => {
                Some(Origin::new(origin.scheme(), origin.host(), cached.port))
            }
            Some(_) => {
                entries.remove(origin);
                None
            }
            None => None,
        }
    }

    /// Forget `origin`, e.g. after its QUIC endpoint failed.
    pub fn forget(&self, origin: &Origin) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(origin);
    }
}
