//! Browser profile registry.
//!
//! Every supported browser is a compiled-in [`BrowserProfile`]. Adding a
//! browser means adding a table entry here; nothing else changes.

use std::fmt;
use std::str::FromStr;

use super::http2::{
    Http2Profile, CHROMIUM_PSEUDO_ORDER, GECKO_PSEUDO_ORDER, SETTINGS_ENABLE_PUSH,
    SETTINGS_HEADER_TABLE_SIZE, SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS,
    SETTINGS_MAX_FRAME_SIZE, SETTINGS_MAX_HEADER_LIST_SIZE, SETTINGS_NO_RFC7540_PRIORITIES,
    WEBKIT_PSEUDO_ORDER,
};
use super::tls::{CertCompression, TlsProfile};
use crate::error::{Error, Result};
use crate::transport::tcp::TcpFingerprint;

/// Supported browsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Browser {
    #[default]
    Chrome131,
    Chrome133,
    Edge131,
    Firefox133,
    Safari18,
}

impl Browser {
    pub const ALL: [Browser; 5] = [
        Browser::Chrome131,
        Browser::Chrome133,
        Browser::Edge131,
        Browser::Firefox133,
        Browser::Safari18,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chrome131 => "chrome131",
            Self::Chrome133 => "chrome133",
            Self::Edge131 => "edge131",
            Self::Firefox133 => "firefox133",
            Self::Safari18 => "safari18",
        }
    }

    pub fn profile(&self) -> &'static BrowserProfile {
        match self {
            Self::Chrome131 => &CHROME_131,
            Self::Chrome133 => &CHROME_133,
            Self::Edge131 => &EDGE_131,
            Self::Firefox133 => &FIREFOX_133,
            Self::Safari18 => &SAFARI_18,
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Browser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = s.trim().to_ascii_lowercase().replace(['_', '-'], "");
        Ok(match id.as_str() {
            "chrome" | "chrome133" => Self::Chrome133,
            "chrome131" => Self::Chrome131,
            "edge" | "edge131" => Self::Edge131,
            "firefox" | "firefox133" => Self::Firefox133,
            "safari" | "safari18" => Self::Safari18,
            _ => {
                return Err(Error::configuration(format!(
                    "unknown browser profile {:?}",
                    s
                )))
            }
        })
    }
}

/// Look a profile up by identifier (`chrome131`, `firefox`, ...).
pub fn resolve(identifier: &str) -> Result<&'static BrowserProfile> {
    Ok(identifier.parse::<Browser>()?.profile())
}

/// QUIC transport parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicProfile {
    pub max_idle_timeout_ms: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_udp_payload_size: usize,
}

/// Everything needed to look like one browser on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub browser: Browser,
    pub user_agent: &'static str,
    pub tls: TlsProfile,
    pub http2: Http2Profile,
    pub quic: QuicProfile,
    pub tcp: TcpFingerprint,
    /// Headers sent with every request unless overridden.
    pub headers: &'static [(&'static str, &'static str)],
    /// Lower-case header names in emission order.
    pub header_order: &'static [&'static str],
}

impl BrowserProfile {
    pub fn ja3_string(&self) -> String {
        self.tls.ja3_string()
    }

    pub fn akamai_h2_string(&self) -> String {
        self.http2.akamai_string()
    }
}

const CHROMIUM_CIPHERS: &[u16] = &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035,
];

const CHROMIUM_SIGALGS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
];

const TCP_ALPN: &[&str] = &["h2", "http/1.1"];

const CHROMIUM_131_TLS: TlsProfile = TlsProfile {
    cipher_suites: CHROMIUM_CIPHERS,
    extensions: &[0, 23, 65281, 10, 11, 35, 16, 5, 13, 18, 51, 45, 43, 27, 17513, 21],
    curves: &[29, 23, 24],
    point_formats: &[0],
    sigalgs: CHROMIUM_SIGALGS,
    grease: true,
    cert_compression: CertCompression::Brotli,
    alpn: TCP_ALPN,
};

const CHROMIUM_HTTP2: Http2Profile = Http2Profile {
    settings: &[
        (SETTINGS_HEADER_TABLE_SIZE, 65_536),
        (SETTINGS_ENABLE_PUSH, 0),
        (SETTINGS_INITIAL_WINDOW_SIZE, 6_291_456),
        (SETTINGS_MAX_HEADER_LIST_SIZE, 262_144),
    ],
    window_update: 15_663_105,
    pseudo_order: CHROMIUM_PSEUDO_ORDER,
};

const CHROMIUM_QUIC: QuicProfile = QuicProfile {
    max_idle_timeout_ms: 30_000,
    initial_max_data: 15_663_105,
    initial_max_stream_data: 6_291_456,
    initial_max_streams_bidi: 100,
    initial_max_streams_uni: 103,
    max_udp_payload_size: 1350,
};

const CHROMIUM_HEADER_ORDER: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "cache-control",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "upgrade-insecure-requests",
    "origin",
    "content-type",
    "user-agent",
    "accept",
    "sec-fetch-site",
    "sec-fetch-mode",
    "sec-fetch-user",
    "sec-fetch-dest",
    "referer",
    "accept-encoding",
    "accept-language",
    "cookie",
    "priority",
];

const CHROME_131_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CHROME_133_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";
const EDGE_131_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0";
const FIREFOX_133_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0";
const SAFARI_18_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.0 Safari/605.1.15";

const CHROMIUM_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

static CHROME_131: BrowserProfile = BrowserProfile {
    browser: Browser::Chrome131,
    user_agent: CHROME_131_UA,
    tls: CHROMIUM_131_TLS,
    http2: CHROMIUM_HTTP2,
    quic: CHROMIUM_QUIC,
    tcp: TcpFingerprint::MACOS,
    headers: &[
        ("sec-ch-ua", r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", r#""macOS""#),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", CHROME_131_UA),
        ("accept", CHROMIUM_ACCEPT),
        ("sec-fetch-site", "none"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-user", "?1"),
        ("sec-fetch-dest", "document"),
        ("accept-encoding", "gzip, deflate, br, zstd"),
        ("accept-language", "en-US,en;q=0.9"),
        ("priority", "u=0, i"),
    ],
    header_order: CHROMIUM_HEADER_ORDER,
};

static CHROME_133: BrowserProfile = BrowserProfile {
    browser: Browser::Chrome133,
    user_agent: CHROME_133_UA,
    tls: TlsProfile {
        extensions: &[0, 23, 65281, 10, 11, 35, 16, 5, 13, 18, 51, 45, 43, 27, 17613, 65037],
        ..CHROMIUM_131_TLS
    },
    http2: CHROMIUM_HTTP2,
    quic: CHROMIUM_QUIC,
    tcp: TcpFingerprint::MACOS,
    headers: &[
        ("sec-ch-ua", r#""Not(A:Brand";v="99", "Google Chrome";v="133", "Chromium";v="133""#),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", r#""macOS""#),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", CHROME_133_UA),
        ("accept", CHROMIUM_ACCEPT),
        ("sec-fetch-site", "none"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-user", "?1"),
        ("sec-fetch-dest", "document"),
        ("accept-encoding", "gzip, deflate, br, zstd"),
        ("accept-language", "en-US,en;q=0.9"),
        ("priority", "u=0, i"),
    ],
    header_order: CHROMIUM_HEADER_ORDER,
};

static EDGE_131: BrowserProfile = BrowserProfile {
    browser: Browser::Edge131,
    user_agent: EDGE_131_UA,
    tls: CHROMIUM_131_TLS,
    http2: CHROMIUM_HTTP2,
    quic: CHROMIUM_QUIC,
    tcp: TcpFingerprint::WINDOWS,
    headers: &[
        ("sec-ch-ua", r#""Microsoft Edge";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", r#""Windows""#),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", EDGE_131_UA),
        ("accept", CHROMIUM_ACCEPT),
        ("sec-fetch-site", "none"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-user", "?1"),
        ("sec-fetch-dest", "document"),
        ("accept-encoding", "gzip, deflate, br, zstd"),
        ("accept-language", "en-US,en;q=0.9"),
        ("priority", "u=0, i"),
    ],
    header_order: CHROMIUM_HEADER_ORDER,
};

static FIREFOX_133: BrowserProfile = BrowserProfile {
    browser: Browser::Firefox133,
    user_agent: FIREFOX_133_UA,
    tls: TlsProfile {
        cipher_suites: &[
            0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a,
            0xc009, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ],
        extensions: &[0, 23, 65281, 10, 11, 35, 16, 5, 34, 51, 43, 13, 45, 28, 27, 65037],
        curves: &[29, 23, 24, 25, 256, 257],
        point_formats: &[0],
        sigalgs: &[
            "ecdsa_secp256r1_sha256",
            "ecdsa_secp384r1_sha384",
            "ecdsa_secp521r1_sha512",
            "rsa_pss_rsae_sha256",
            "rsa_pss_rsae_sha384",
            "rsa_pss_rsae_sha512",
            "rsa_pkcs1_sha256",
            "rsa_pkcs1_sha384",
            "rsa_pkcs1_sha512",
        ],
        grease: false,
        cert_compression: CertCompression::Zlib,
        alpn: TCP_ALPN,
    },
    http2: Http2Profile {
        settings: &[
            (SETTINGS_HEADER_TABLE_SIZE, 65_536),
            (SETTINGS_ENABLE_PUSH, 0),
            (SETTINGS_INITIAL_WINDOW_SIZE, 131_072),
            (SETTINGS_MAX_FRAME_SIZE, 16_384),
        ],
        window_update: 12_517_377,
        pseudo_order: GECKO_PSEUDO_ORDER,
    },
    quic: QuicProfile {
        max_idle_timeout_ms: 30_000,
        initial_max_data: 25_165_824,
        initial_max_stream_data: 12_582_912,
        initial_max_streams_bidi: 16,
        initial_max_streams_uni: 16,
        max_udp_payload_size: 1350,
    },
    tcp: TcpFingerprint::MACOS,
    headers: &[
        ("user-agent", FIREFOX_133_UA),
        ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        ("accept-language", "en-US,en;q=0.5"),
        ("accept-encoding", "gzip, deflate, br, zstd"),
        ("upgrade-insecure-requests", "1"),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
        ("sec-fetch-user", "?1"),
        ("priority", "u=0, i"),
    ],
    header_order: &[
        "host",
        "user-agent",
        "accept",
        "accept-language",
        "accept-encoding",
        "content-type",
        "content-length",
        "origin",
        "connection",
        "referer",
        "cookie",
        "upgrade-insecure-requests",
        "sec-fetch-dest",
        "sec-fetch-mode",
        "sec-fetch-site",
        "sec-fetch-user",
        "priority",
        "te",
    ],
};

static SAFARI_18: BrowserProfile = BrowserProfile {
    browser: Browser::Safari18,
    user_agent: SAFARI_18_UA,
    tls: TlsProfile {
        cipher_suites: &[
            0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a,
            0xc009, 0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f, 0xc008, 0xc012, 0x000a,
        ],
        extensions: &[0, 23, 65281, 10, 11, 16, 5, 13, 18, 51, 45, 43, 27, 21],
        curves: &[29, 23, 24, 25],
        point_formats: &[0],
        sigalgs: &[
            "ecdsa_secp256r1_sha256",
            "rsa_pss_rsae_sha256",
            "rsa_pkcs1_sha256",
            "ecdsa_secp384r1_sha384",
            "rsa_pss_rsae_sha384",
            "rsa_pkcs1_sha384",
            "rsa_pss_rsae_sha512",
            "rsa_pkcs1_sha512",
        ],
        grease: true,
        cert_compression: CertCompression::Zlib,
        alpn: TCP_ALPN,
    },
    http2: Http2Profile {
        settings: &[
            (SETTINGS_ENABLE_PUSH, 0),
            (SETTINGS_MAX_CONCURRENT_STREAMS, 100),
            (SETTINGS_INITIAL_WINDOW_SIZE, 2_097_152),
            (SETTINGS_NO_RFC7540_PRIORITIES, 1),
        ],
        window_update: 10_420_225,
        pseudo_order: WEBKIT_PSEUDO_ORDER,
    },
    quic: QuicProfile {
        max_idle_timeout_ms: 30_000,
        initial_max_data: 10_485_760,
        initial_max_stream_data: 2_097_152,
        initial_max_streams_bidi: 100,
        initial_max_streams_uni: 100,
        max_udp_payload_size: 1350,
    },
    tcp: TcpFingerprint::MACOS,
    headers: &[
        ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        ("sec-fetch-site", "none"),
        ("sec-fetch-dest", "document"),
        ("accept-language", "en-US,en;q=0.9"),
        ("sec-fetch-mode", "navigate"),
        ("user-agent", SAFARI_18_UA),
        ("accept-encoding", "gzip, deflate, br"),
        ("priority", "u=0, i"),
    ],
    header_order: &[
        "host",
        "content-type",
        "origin",
        "content-length",
        "accept",
        "sec-fetch-site",
        "cookie",
        "sec-fetch-dest",
        "referer",
        "accept-language",
        "sec-fetch-mode",
        "user-agent",
        "accept-encoding",
        "priority",
        "connection",
    ],
};
