//! TLS, HTTP/2 and QUIC fingerprint configuration per browser.

pub mod http2;
pub mod profiles;
pub mod tls;

pub use http2::{Http2Profile, PseudoHeader};
pub use profiles::{resolve, Browser, BrowserProfile, QuicProfile};
pub use tls::{build_quic_config, build_tls_config, CertCompression, TlsConfig, TlsProfile};
