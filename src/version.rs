//! HTTP protocol versions.

use std::fmt;

/// Protocol negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    /// HTTP/1.1 over TCP (plain or TLS).
    Http1_1,
    /// HTTP/2 over TLS, selected by ALPN `h2`.
    Http2,
    /// HTTP/3 over QUIC.
    Http3,
}

impl HttpVersion {
    /// Version string as reported on responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http1_1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
        }
    }

    /// ALPN protocol identifier.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            Self::Http1_1 => b"http/1.1",
            Self::Http2 => b"h2",
            Self::Http3 => b"h3",
        }
    }

    /// Map a negotiated ALPN identifier back to a version.
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(Self::Http1_1),
            b"h2" => Some(Self::Http2),
            b"h3" => Some(Self::Http3),
            _ => None,
        }
    }

    /// Check if this version supports multiplexing.
    pub fn supports_multiplexing(&self) -> bool {
        matches!(self, Self::Http2 | Self::Http3)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_mapping() {
        for v in [HttpVersion::Http1_1, HttpVersion::Http2, HttpVersion::Http3] {
            assert_eq!(HttpVersion::from_alpn(v.alpn_id()), Some(v));
        }
        assert_eq!(HttpVersion::from_alpn(b"spdy/3"), None);
    }

    #[test]
    fn test_multiplexing() {
        assert!(!HttpVersion::Http1_1.supports_multiplexing());
        assert!(HttpVersion::Http2.supports_multiplexing());
        assert!(HttpVersion::Http3.supports_multiplexing());
    }
}
