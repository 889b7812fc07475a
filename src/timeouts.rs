//! Timeout configuration for HTTP requests.
//!
//! A request's budget is split into independent slots:
//!
//! - **connect**: TCP connect (and proxy CONNECT tunnel, QUIC handshake)
//! - **tls_handshake**: TLS handshake after the TCP connection is up
//! - **write**: sending request head and body
//! - **read**: waiting for response headers and for each body chunk (resets per chunk)
//! - **pool**: waiting for a connection slot from the pool
//!
//! # Usage
//!
//! ```rust,ignore
//! use guise::{Client, Timeouts};
//! use std::time::Duration;
//!
//! let client = Client::builder()
//!     .timeouts(Timeouts::api_defaults().read(Duration::from_secs(60)))
//!     .build()?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeout configuration for HTTP requests.
///
/// All timeouts are optional. When `None`, no timeout is applied for that phase.
///
/// # Timeout Semantics
///
/// - **connect**: Does NOT reset. Deadline for establishing the transport.
/// - **tls_handshake**: Does NOT reset. Falls back to `connect` when unset.
/// - **write**: Applies to each write of the request.
/// - **read**: RESETS on each chunk received. Detects hung streams.
/// - **pool**: Does NOT reset. Time waiting for a pooled connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Timeout for establishing the connection (DNS + TCP, proxy tunnel, QUIC).
    pub connect: Option<Duration>,

    /// Timeout for the TLS handshake on TCP connections.
    pub tls_handshake: Option<Duration>,

    /// Timeout for each write of request bytes.
    pub write: Option<Duration>,

    /// Read timeout: maximum time waiting for response headers or the next body chunk.
    ///
    /// **This timeout resets on each successful read.**
    pub read: Option<Duration>,

    /// Pool acquire timeout: time waiting for an available pooled connection.
    pub pool: Option<Duration>,

    /// Slots switched off with a `no_*` method. As a per-request override
    /// these clear the client default instead of inheriting it.
    cleared: u8,
}

const CONNECT: u8 = 1 << 0;
const TLS_HANDSHAKE: u8 = 1 << 1;
const WRITE: u8 = 1 << 2;
const READ: u8 = 1 << 3;
const POOL: u8 = 1 << 4;

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn new() -> Self {
        Self::default()
    }

    /// The same duration for every slot.
    pub fn all(timeout: Duration) -> Self {
        Self {
            connect: Some(timeout),
            tls_handshake: Some(timeout),
            write: Some(timeout),
            read: Some(timeout),
            pool: Some(timeout),
            cleared: 0,
        }
    }

    /// Sensible defaults for normal API calls.
    ///
    /// - connect: 10s
    /// - tls_handshake: 10s
    /// - write: 30s
    /// - read: 30s
    /// - pool: 5s
    pub fn api_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            tls_handshake: Some(Duration::from_secs(10)),
            write: Some(Duration::from_secs(30)),
            read: Some(Duration::from_secs(30)),
            pool: Some(Duration::from_secs(5)),
            cleared: 0,
        }
    }

    /// Defaults for streaming responses (SSE, chunked downloads, etc.).
    ///
    /// Identical to [`api_defaults`](Self::api_defaults) except `read` is 120s
    /// to accommodate variable chunk timing.
    pub fn streaming_defaults() -> Self {
        Self {
            read: Some(Duration::from_secs(120)),
            ..Self::api_defaults()
        }
    }

    /// Set connect timeout.
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self.cleared &= !CONNECT;
        self
    }

    /// Set TLS handshake timeout.
    pub fn tls_handshake(mut self, timeout: Duration) -> Self {
        self.tls_handshake = Some(timeout);
        self.cleared &= !TLS_HANDSHAKE;
        self
    }

    /// Set write timeout.
    pub fn write(mut self, timeout: Duration) -> Self {
        self.write = Some(timeout);
        self.cleared &= !WRITE;
        self
    }

    /// Set read timeout.
    pub fn read(mut self, timeout: Duration) -> Self {
        self.read = Some(timeout);
        self.cleared &= !READ;
        self
    }

    /// Set pool acquire timeout.
    pub fn pool(mut self, timeout: Duration) -> Self {
        self.pool = Some(timeout);
        self.cleared &= !POOL;
        self
    }

    pub fn no_connect_timeout(mut self) -> Self {
        self.connect = None;
        self.cleared |= CONNECT;
        self
    }

    pub fn no_tls_handshake_timeout(mut self) -> Self {
        self.tls_handshake = None;
        self.cleared |= TLS_HANDSHAKE;
        self
    }

    pub fn no_write_timeout(mut self) -> Self {
        self.write = None;
        self.cleared |= WRITE;
        self
    }

    pub fn no_read_timeout(mut self) -> Self {
        self.read = None;
        self.cleared |= READ;
        self
    }

    pub fn no_pool_timeout(mut self) -> Self {
        self.pool = None;
        self.cleared |= POOL;
        self
    }

    /// Per-request budget: each slot set in `overrides` wins, a slot the
    /// override switched off with `no_*` has no timeout, otherwise the client
    /// default applies.
    pub fn resolve(overrides: &Timeouts, defaults: &Timeouts) -> Timeouts {
        let pick = |bit: u8, own: Option<Duration>, default: Option<Duration>| {
            if overrides.cleared & bit != 0 {
                None
            } else {
                own.or(default)
            }
        };
        Timeouts {
            connect: pick(CONNECT, overrides.connect, defaults.connect),
            tls_handshake: pick(TLS_HANDSHAKE, overrides.tls_handshake, defaults.tls_handshake),
            write: pick(WRITE, overrides.write, defaults.write),
            read: pick(READ, overrides.read, defaults.read),
            pool: pick(POOL, overrides.pool, defaults.pool),
            cleared: 0,
        }
    }

    /// TLS budget, falling back to the connect budget.
    pub fn tls_budget(&self) -> Option<Duration> {
        self.tls_handshake.or(self.connect)
    }
}

/// Run `fut` under an optional budget, mapping expiry through `on_timeout`.
///
/// The timed-out future is dropped, which cancels the in-flight operation.
pub(crate) async fn within<T, F>(
    budget: Option<Duration>,
    on_timeout: fn(Duration) -> Error,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match budget {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(on_timeout(limit)),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_api_defaults() {
        let t = Timeouts::api_defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.read, Some(Duration::from_secs(30)));
        assert_eq!(t.pool, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_streaming_defaults() {
        let t = Timeouts::streaming_defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.read, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_builder_pattern() {
        let t = Timeouts::new()
            .connect(Duration::from_secs(5))
            .read(Duration::from_secs(60));

        assert_eq!(t.connect, Some(Duration::from_secs(5)));
        assert_eq!(t.read, Some(Duration::from_secs(60)));
        assert_eq!(t.write, None);
        assert_eq!(t.tls_budget(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_resolve_precedence() {
        let defaults = Timeouts::new()
            .connect(Duration::from_secs(10))
            .read(Duration::from_secs(30));
        let overrides = Timeouts::new().read(Duration::from_secs(1));

        let budget = Timeouts::resolve(&overrides, &defaults);
        assert_eq!(budget.read, Some(Duration::from_secs(1)));
        assert_eq!(budget.connect, Some(Duration::from_secs(10)));
        assert_eq!(budget.pool, None);
    }

    #[test]
    fn test_resolve_override_can_clear_default() {
        let defaults = Timeouts::api_defaults();

        let budget = Timeouts::resolve(&Timeouts::new().no_read_timeout(), &defaults);
        assert_eq!(budget.read, None);
        assert_eq!(budget.connect, defaults.connect);

        // an unset slot still inherits
        let budget = Timeouts::resolve(&Timeouts::new(), &defaults);
        assert_eq!(budget, defaults);

        // setting the slot again undoes the clear
        let overrides = Timeouts::new().no_pool_timeout().pool(Duration::from_secs(1));
        let budget = Timeouts::resolve(&overrides, &defaults);
        assert_eq!(budget.pool, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_within_maps_expiry() {
        let res: Result<()> = within(
            Some(Duration::from_millis(10)),
            Error::write_timeout,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::WriteTimeout);
    }
}
