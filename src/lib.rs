//! # Guise
//!
//! HTTP client whose traffic looks like a real browser's on the wire.
//!
//! Each [`Client`] is bound to one browser profile: the TLS ClientHello
//! (cipher, extension and group order), the ALPN offer, HTTP/2 SETTINGS and
//! pseudo-header order, and the default headers and their order all come
//! from the profile. Requests run over HTTP/1.1, HTTP/2 or HTTP/3 through a
//! shared connection pool.
//!
//! ```no_run
//! # async fn demo() -> guise::Result<()> {
//! let client = guise::Client::builder()
//!     .browser(guise::Browser::Firefox133)
//!     .build()?;
//! let response = client.get("https://example.com/").send().await?;
//! println!("{} over {}", response.status(), response.http_version());
//! println!("{}", response.text()?);
//! # Ok(())
//! # }
//! ```
//!
//! A blocking facade lives in [`blocking`].

pub mod blocking;
pub mod client;
pub mod cookie;
mod decoding;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod pool;
pub mod request;
pub mod response;
pub mod timeouts;
pub mod transport;
pub mod version;

pub use client::{Client, ClientBuilder};
pub use cookie::{Cookie, CookieJar, CookieStore};
pub use error::{Error, ErrorKind, ProtocolActor, Result, TransportPhase};
pub use fingerprint::{Browser, BrowserProfile};
pub use headers::Headers;
pub use pool::PoolStats;
pub use request::{Request, RequestBuilder};
pub use response::{BodyState, HistoryEntry, Response};
pub use timeouts::Timeouts;
pub use version::HttpVersion;

pub use http::Method;
pub use url::Url;
