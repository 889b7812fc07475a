//! Connection pool.
//!
//! Connections are grouped per origin and transport (TCP or QUIC).
//! HTTP/1.1 connections are leased exclusively and come back idle once a
//! response is fully read; HTTP/2 and HTTP/3 connections stay in the pool
//! and hand out one lease per stream up to the peer's concurrency limit.
//!
//! All bookkeeping happens under one mutex that is never held across an
//! await; waiting acquirers park on a [`Notify`] and re-check on wakeup.

pub mod alt_svc;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{Error, ErrorKind, Result};
use crate::transport::connector::Connection;
use crate::transport::h1::H1Connection;
use crate::transport::Origin;
use crate::version::HttpVersion;

/// How the origin is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TLS over TCP (or plain TCP); HTTP/1.1 or HTTP/2 by ALPN.
    Tcp,
    /// HTTP/3.
    Quic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub origin: Origin,
    pub transport: Transport,
}

impl PoolKey {
    pub fn new(origin: Origin, transport: Transport) -> Self {
        Self { origin, transport }
    }
}

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections per key, counting idle, leased and connecting ones.
    pub max_per_host: usize,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
    /// Acquirers allowed to queue per key before failing immediately.
    pub max_waiters: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: 6,
            idle_timeout: Duration::from_secs(30),
            max_waiters: 1024,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub http1_connections: usize,
    pub http2_connections: usize,
    pub http3_connections: usize,
    /// Connections with nothing in flight.
    pub idle_connections: usize,
    /// Leases currently out (one per in-flight request).
    pub active_streams: usize,
    /// Multiplexed connections that refuse new streams but still carry some.
    pub draining: usize,
    pub connecting: usize,
    pub waiters: usize,
}

struct IdleH1 {
    conn: H1Connection,
    since: Instant,
}

struct SharedConn {
    id: u64,
    conn: Connection,
    active: usize,
    idle_since: Instant,
}

impl SharedConn {
    fn has_slot(&self) -> bool {
        !self.conn.is_closed() && self.active < self.conn.max_streams()
    }

    fn lease_handle(&self) -> Option<Connection> {
        match &self.conn {
            Connection::H2(handle) => Some(Connection::H2(handle.clone())),
            Connection::H3(handle) => Some(Connection::H3(handle.clone())),
            Connection::H1(_) => None,
        }
    }
}

struct HostEntry {
    idle: Vec<IdleH1>,
    leased_h1: usize,
    shared: Vec<SharedConn>,
    connecting: usize,
    waiters: usize,
    /// Whether this key's connections multiplex, once known.
    multiplexed: Option<bool>,
}

impl HostEntry {
    fn new(key: &PoolKey) -> Self {
        let multiplexed = match key.transport {
            Transport::Quic => Some(true),
            // no ALPN without TLS
            Transport::Tcp if !key.origin.is_https() => Some(false),
            Transport::Tcp => None,
        };
        Self {
            idle: Vec::new(),
            leased_h1: 0,
            shared: Vec::new(),
            connecting: 0,
            waiters: 0,
            multiplexed,
        }
    }

    fn open_connections(&self) -> usize {
        self.idle.len() + self.leased_h1 + self.shared.len() + self.connecting
    }

    fn is_unused(&self) -> bool {
        self.open_connections() == 0 && self.waiters == 0
    }

    fn prune(&mut self, idle_timeout: Duration, now: Instant) {
        self.idle
            .retain(|c| now.duration_since(c.since) < idle_timeout);
        self.shared.retain(|c| {
            c.active > 0 || (!c.conn.is_closed() && now.duration_since(c.idle_since) < idle_timeout)
        });
    }
}

#[derive(Default)]
struct State {
    hosts: HashMap<PoolKey, HostEntry>,
    next_id: u64,
}

enum Checkout {
    Ready(Lease),
    Idle(Lease),
    Connect,
    Wait,
}

#[derive(Debug, Clone, Copy)]
enum LeaseKind {
    Exclusive,
    Shared(u64),
}

/// Owns every connection; see the module docs.
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. Inside a tokio runtime this also starts a task that
    /// closes expired idle connections; otherwise they are pruned lazily.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        });
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&pool);
            let period = (config.idle_timeout / 2).max(Duration::from_secs(1));
            runtime.spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    match weak.upgrade() {
                        Some(pool) => pool.prune(),
                        None => break,
                    }
                }
            });
        }
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease a connection for `key`, reusing one when possible and calling
    /// `connect` when a new one may be opened. Waiting for a free slot is
    /// bounded by `pool_timeout`; the connect itself is not.
    pub async fn acquire<F, Fut>(
        self: &Arc<Self>,
        key: &PoolKey,
        pool_timeout: Option<Duration>,
        connect: F,
    ) -> Result<Lease>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        let deadline = pool_timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.checkout(key)? {
                Checkout::Ready(lease) => return Ok(lease),
                Checkout::Idle(mut lease) => {
                    let stale = match lease.conn_mut() {
                        Some(Connection::H1(conn)) => conn.is_stale().await,
                        _ => false,
                    };
                    if !stale {
                        tracing::trace!(origin = %key.origin, "reusing idle connection");
                        return Ok(lease);
                    }
                    tracing::debug!(origin = %key.origin, "idle connection went stale");
                    lease.discard();
                }
                Checkout::Connect => {
                    let guard = SlotGuard::new(self, key, Slot::Connecting);
                    let res = connect().await;
                    return self.register(key, guard, res);
                }
                Checkout::Wait => {
                    let guard = SlotGuard::new(self, key, Slot::Waiter);
                    let woke = match deadline {
                        Some(at) => tokio::time::timeout_at(at, notified.as_mut()).await.is_ok(),
                        None => {
                            notified.as_mut().await;
                            true
                        }
                    };
                    drop(guard);
                    if !woke {
                        let waited = pool_timeout.unwrap_or_default();
                        tracing::debug!(origin = %key.origin, ?waited, "pool wait timed out");
                        return Err(Error::pool_timeout(waited).with_origin(&key.origin));
                    }
                }
            }
        }
    }

    fn checkout(self: &Arc<Self>, key: &PoolKey) -> Result<Checkout> {
        let config = self.config;
        let mut state = self.lock();
        let entry = state
            .hosts
            .entry(key.clone())
            .or_insert_with(|| HostEntry::new(key));
        entry.prune(config.idle_timeout, Instant::now());

        if let Some(shared) = entry.shared.iter_mut().find(|c| c.has_slot()) {
            if let Some(conn) = shared.lease_handle() {
                shared.active += 1;
                let lease = Lease::new(self.clone(), key.clone(), LeaseKind::Shared(shared.id), conn);
                return Ok(Checkout::Ready(lease));
            }
        }

        if let Some(idle) = entry.idle.pop() {
            entry.leased_h1 += 1;
            let lease = Lease::new(
                self.clone(),
                key.clone(),
                LeaseKind::Exclusive,
                Connection::H1(idle.conn),
            );
            return Ok(Checkout::Idle(lease));
        }

        // a connect in progress may yield a multiplexed connection to share
        let awaiting_shared = entry.connecting > 0 && entry.multiplexed != Some(false);
        if !awaiting_shared && entry.open_connections() < config.max_per_host {
            entry.connecting += 1;
            return Ok(Checkout::Connect);
        }

        if entry.waiters >= config.max_waiters {
            return Err(Error::new(
                ErrorKind::PoolTimeout,
                format!("{} requests already waiting for a connection", entry.waiters),
            )
            .with_origin(&key.origin));
        }
        entry.waiters += 1;
        Ok(Checkout::Wait)
    }

    fn register(
        self: &Arc<Self>,
        key: &PoolKey,
        mut guard: SlotGuard<'_>,
        res: Result<Connection>,
    ) -> Result<Lease> {
        guard.disarm();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let entry = state
            .hosts
            .entry(key.clone())
            .or_insert_with(|| HostEntry::new(key));
        entry.connecting = entry.connecting.saturating_sub(1);

        let outcome = match res {
            Err(e) => Err(e),
            Ok(Connection::H1(conn)) => {
                entry.multiplexed = Some(false);
                entry.leased_h1 += 1;
                Ok(Lease::new(self.clone(), key.clone(), LeaseKind::Exclusive, Connection::H1(conn)))
            }
            Ok(conn) => {
                entry.multiplexed = Some(true);
                let shared = SharedConn {
                    id,
                    conn,
                    active: 1,
                    idle_since: Instant::now(),
                };
                match shared.lease_handle() {
                    Some(handle) => {
                        entry.shared.push(shared);
                        Ok(Lease::new(self.clone(), key.clone(), LeaseKind::Shared(id), handle))
                    }
                    None => Err(Error::local_protocol("connection cannot be shared")),
                }
            }
        };
        if let Ok(lease) = &outcome {
            tracing::debug!(origin = %key.origin, version = %lease.version(), "new connection pooled");
        }
        drop(state);
        self.notify.notify_waiters();
        outcome
    }

    fn give_back(&self, key: &PoolKey, kind: LeaseKind, conn: Connection, reuse: bool) {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(entry) = state.hosts.get_mut(key) {
            match (kind, conn) {
                (LeaseKind::Exclusive, Connection::H1(conn)) => {
                    entry.leased_h1 = entry.leased_h1.saturating_sub(1);
                    if reuse && conn.is_reusable() {
                        tracing::trace!(origin = %key.origin, "connection returned idle");
                        entry.idle.push(IdleH1 { conn, since: now });
                    } else {
                        tracing::debug!(origin = %key.origin, "closing connection");
                    }
                }
                (LeaseKind::Shared(id), _) => {
                    if let Some(pos) = entry.shared.iter().position(|c| c.id == id) {
                        let shared = &mut entry.shared[pos];
                        shared.active = shared.active.saturating_sub(1);
                        if shared.active == 0 {
                            shared.idle_since = now;
                        }
                        if !reuse || (shared.active == 0 && shared.conn.is_closed()) {
                            tracing::debug!(origin = %key.origin, "retiring multiplexed connection");
                            entry.shared.swap_remove(pos);
                        }
                    }
                }
                (LeaseKind::Exclusive, _) => {}
            }
            if entry.is_unused() {
                state.hosts.remove(key);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn release_slot(&self, key: &PoolKey, slot: Slot) {
        let mut state = self.lock();
        if let Some(entry) = state.hosts.get_mut(key) {
            match slot {
                Slot::Connecting => entry.connecting = entry.connecting.saturating_sub(1),
                Slot::Waiter => entry.waiters = entry.waiters.saturating_sub(1),
            }
            if entry.is_unused() {
                state.hosts.remove(key);
            }
        }
        drop(state);
        if matches!(slot, Slot::Connecting) {
            self.notify.notify_waiters();
        }
    }

    /// Close connections idle past the configured timeout.
    pub fn prune(&self) {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let mut state = self.lock();
        for entry in state.hosts.values_mut() {
            entry.prune(idle_timeout, now);
        }
        state.hosts.retain(|_, e| !e.is_unused());
    }

    /// Close every connection that has nothing in flight.
    pub fn close_idle(&self) {
        let mut state = self.lock();
        for entry in state.hosts.values_mut() {
            entry.idle.clear();
            entry.shared.retain(|c| c.active > 0);
        }
        state.hosts.retain(|_, e| !e.is_unused());
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = PoolStats::default();
        for entry in state.hosts.values() {
            stats.http1_connections += entry.idle.len() + entry.leased_h1;
            stats.idle_connections += entry.idle.len();
            stats.active_streams += entry.leased_h1;
            stats.connecting += entry.connecting;
            stats.waiters += entry.waiters;
            for shared in &entry.shared {
                match shared.conn.version() {
                    HttpVersion::Http3 => stats.http3_connections += 1,
                    _ => stats.http2_connections += 1,
                }
                stats.active_streams += shared.active;
                if shared.active == 0 {
                    stats.idle_connections += 1;
                } else if shared.conn.is_closed() {
                    stats.draining += 1;
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Connecting,
    Waiter,
}

/// Gives a connecting or waiting slot back if the acquire is cancelled.
struct SlotGuard<'a> {
    pool: &'a ConnectionPool,
    key: &'a PoolKey,
    slot: Slot,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(pool: &'a ConnectionPool, key: &'a PoolKey, slot: Slot) -> Self {
        Self {
            pool,
            key,
            slot,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(self.key, self.slot);
        }
    }
}

/// Right to use one connection (HTTP/1.1) or one stream slot (HTTP/2, 3).
///
/// Dropping a lease releases it; an HTTP/1.1 connection that is mid-message
/// at that point is closed instead of being pooled.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    kind: LeaseKind,
    version: HttpVersion,
    conn: Option<Connection>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .finish()
    }
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, key: PoolKey, kind: LeaseKind, conn: Connection) -> Self {
        Self {
            pool,
            key,
            kind,
            version: conn.version(),
            conn: Some(conn),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// `None` only after the lease was given back.
    pub fn conn_mut(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    /// Return the connection for reuse.
    pub fn release(mut self) {
        self.finish(true);
    }

    /// Close the connection (HTTP/1.1) or stop handing out the shared
    /// connection (HTTP/2, HTTP/3).
    pub fn discard(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, reuse: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(&self.key, self.kind, conn, reuse);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.finish(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Browser;
    use crate::transport::h2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    fn key(scheme: &str) -> PoolKey {
        PoolKey::new(Origin::new(scheme, "example.com", 443), Transport::Tcp)
    }

    fn small_pool(max_per_host: usize) -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig {
            max_per_host,
            ..PoolConfig::default()
        })
    }

    /// H1 connection over an in-memory pipe; the far end is kept alive.
    fn h1_pair(peers: &Mutex<Vec<DuplexStream>>) -> Connection {
        let (client, server) = tokio::io::duplex(1024);
        peers.lock().unwrap().push(server);
        Connection::H1(H1Connection::new(client))
    }

    #[tokio::test]
    async fn test_h1_connection_reused_after_release() {
        let pool = small_pool(4);
        let peers = Mutex::new(Vec::new());
        let connects = AtomicUsize::new(0);
        let (peers, connects) = (&peers, &connects);
        let connect = move || async move {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(h1_pair(peers))
        };

        let lease = pool.acquire(&key("http"), None, connect).await.unwrap();
        assert_eq!(lease.version(), HttpVersion::Http1_1);
        lease.release();
        assert_eq!(pool.stats().idle_connections, 1);

        let lease = pool.acquire(&key("http"), None, connect).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().active_streams, 1);
        drop(lease);
        assert_eq!(pool.stats().active_streams, 0);
    }

    #[tokio::test]
    async fn test_discarded_connection_is_not_pooled() {
        let pool = small_pool(4);
        let peers = Mutex::new(Vec::new());
        let peers = &peers;
        let lease = pool
            .acquire(&key("http"), None, move || async move { Ok::<_, Error>(h1_pair(peers)) })
            .await
            .unwrap();
        lease.discard();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_pool_timeout_when_host_is_full() {
        let pool = small_pool(1);
        let peers = Mutex::new(Vec::new());
        let peers = &peers;
        let connect = move || async move { Ok::<_, Error>(h1_pair(peers)) };
        let _held = pool.acquire(&key("http"), None, connect).await.unwrap();

        let err = pool
            .acquire(&key("http"), Some(Duration::from_millis(30)), connect)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolTimeout);
        assert_eq!(pool.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let pool = small_pool(1);
        let peers = Arc::new(Mutex::new(Vec::new()));
        let held = {
            let peers = peers.clone();
            pool.acquire(&key("http"), None, move || {
                let peers = peers.clone();
                async move { Ok::<_, Error>(h1_pair(&peers)) }
            })
            .await
            .unwrap()
        };

        let waiter = {
            let pool = pool.clone();
            let peers = peers.clone();
            tokio::spawn(async move {
                pool.acquire(&key("http"), Some(Duration::from_secs(5)), move || {
                    let peers = peers.clone();
                    async move { Ok::<_, Error>(h1_pair(&peers)) }
                })
                .await
                .map(|lease| lease.version())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiters, 1);
        held.release();

        assert_eq!(waiter.await.unwrap().unwrap(), HttpVersion::Http1_1);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let pool = small_pool(1);
        let err = pool
            .acquire(&key("http"), None, || async {
                Err::<Connection, _>(Error::connect("refused"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert_eq!(pool.stats().connecting, 0);
    }

    #[tokio::test]
    async fn test_h2_connection_shared_between_leases() {
        let pool = small_pool(6);
        let servers = Mutex::new(Vec::new());
        let connects = AtomicUsize::new(0);
        let (servers, connects) = (&servers, &connects);
        let connect = move || async move {
            connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(64 * 1024);
            servers.lock().unwrap().push(server);
            let handle = h2::handshake(client, &Browser::Chrome131.profile().http2, None).await?;
            Ok::<_, Error>(Connection::H2(handle))
        };

        let (a, b) = tokio::join!(
            pool.acquire(&key("https"), None, connect),
            pool.acquire(&key("https"), None, connect)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!((stats.http2_connections, stats.active_streams), (1, 2));

        a.release();
        b.release();
        let stats = pool.stats();
        assert_eq!((stats.active_streams, stats.idle_connections), (0, 1));

        pool.close_idle();
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
