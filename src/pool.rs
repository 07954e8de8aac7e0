//! Bounded pool of upstream connections.
//!
//! Entries are authenticated TCP connections to the MongoDB server. At any
//! moment an entry is either idle in the pool or exclusively held by one
//! serve loop; handoff happens by value through [`Pool::acquire`] and
//! [`PooledConn::release`] / [`PooledConn::discard`]. A background
//! maintenance task sweeps every `idle_timeout / 2`, evicting entries that
//! sat idle too long and topping the idle set back up to the warm floor.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::auth::{Authenticator, Credential, NoAuth};
use crate::error::{ProxyError, ProxyResult};
use crate::stats::{start_timer, NoopStats, Stats};

/// Connect timeout for a single dial attempt.
pub const DIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of dial attempts before an acquisition fails.
pub const DIAL_ATTEMPTS: u32 = 7;

/// Backoff before the second dial attempt; doubles each attempt.
pub const DIAL_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Produces new upstream connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> ProxyResult<Self::Conn>;
}

/// Run `op` up to `attempts` times, sleeping `initial_backoff` after the
/// first failure and doubling after each subsequent one.
pub async fn connect_with_retry<T, F, Fut>(
    attempts: u32,
    initial_backoff: Duration,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProxyResult<T>>,
{
    let mut backoff = initial_backoff;
    for attempt in 1..=attempts {
        match op().await {
            Ok(conn) => return Some(conn),
            Err(e) => warn!(attempt, error = %e, "upstream dial attempt failed"),
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    None
}

/// Dials the configured MongoDB address with retry and, when credentials
/// are present, runs the authentication handshake against `admin`.
pub struct ServerConnector {
    addr: String,
    credential: Option<Credential>,
    authenticator: Arc<dyn Authenticator>,
}

impl ServerConnector {
    pub fn new(addr: impl Into<String>, credential: Option<Credential>) -> Self {
        Self {
            addr: addr.into(),
            credential,
            authenticator: Arc::new(NoAuth),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    async fn dial_once(&self) -> ProxyResult<TcpStream> {
        let mut conn = tokio::time::timeout(DIAL_CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

        if let Some(credential) = &self.credential {
            // A failed handshake counts as a failed dial attempt.
            self.authenticator
                .authenticate(&mut conn, credential)
                .await?;
        }
        Ok(conn)
    }
}

#[async_trait]
impl Connector for ServerConnector {
    type Conn = TcpStream;

    async fn connect(&self) -> ProxyResult<TcpStream> {
        match connect_with_retry(DIAL_ATTEMPTS, DIAL_INITIAL_BACKOFF, || self.dial_once()).await {
            Some(conn) => Ok(conn),
            None => Err(ProxyError::ConnectFailed {
                addr: self.addr.clone(),
            }),
        }
    }
}

/// Pool sizing and lifecycle knobs. Immutable once the pool is built.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Cap on total outstanding entries, idle and in-use combined.
    pub max_connections: usize,
    /// Warm floor: the maintenance task keeps at least this many idle.
    pub min_idle: usize,
    /// Idle entries older than this are evicted.
    pub idle_timeout: Duration,
    /// Concurrency used when closing entries during eviction and drain.
    pub close_pool_size: usize,
}

/// Sink for close errors observed during eviction and drain. They are
/// reported here and never propagated to callers.
pub type CloseErrorHandler = Box<dyn Fn(&io::Error) + Send + Sync>;

struct IdleConn<T> {
    conn: T,
    released_at: Instant,
}

struct PoolState<T> {
    /// Idle entries, oldest first.
    idle: Vec<IdleConn<T>>,
    /// Outstanding entries: idle + in-use.
    total: usize,
    closed: bool,
}

struct PoolInner<C: Connector> {
    connector: C,
    options: PoolOptions,
    state: Mutex<PoolState<C::Conn>>,
    available: Notify,
    stats: Arc<dyn Stats>,
    close_error_handler: CloseErrorHandler,
}

pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Build the pool and spawn its maintenance task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        connector: C,
        options: PoolOptions,
        stats: Arc<dyn Stats>,
        close_error_handler: CloseErrorHandler,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            connector,
            options,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            available: Notify::new(),
            stats,
            close_error_handler,
        });
        Self::spawn_maintenance(&inner);
        Self { inner }
    }

    pub fn with_noop_stats(connector: C, options: PoolOptions) -> Self {
        Self::new(
            connector,
            options,
            Arc::new(NoopStats),
            Box::new(|e| warn!(error = %e, "upstream close failed")),
        )
    }

    /// Acquire an entry: an idle one when available, a freshly dialed one
    /// while there is room, otherwise wait until a holder releases or
    /// discards. Fails once the pool is draining.
    pub async fn acquire(&self) -> ProxyResult<PooledConn<C>> {
        let timer = start_timer(&self.inner.stats, "acquire.time");
        loop {
            let notified = self.inner.available.notified();

            enum Slot<T> {
                Reuse(T),
                Dial,
                Wait,
            }

            let decision = {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(ProxyError::PoolClosed);
                }
                if let Some(entry) = state.idle.pop() {
                    Slot::Reuse(entry.conn)
                } else if state.total < self.inner.options.max_connections {
                    state.total += 1;
                    Slot::Dial
                } else {
                    Slot::Wait
                }
            };

            match decision {
                Slot::Reuse(conn) => {
                    self.inner.stats.bump("reuse", 1);
                    timer.stop();
                    return Ok(PooledConn {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Slot::Dial => match self.inner.connector.connect().await {
                    Ok(conn) => {
                        self.inner.stats.bump("new", 1);
                        timer.stop();
                        return Ok(PooledConn {
                            conn: Some(conn),
                            pool: Arc::clone(&self.inner),
                        });
                    }
                    Err(e) => {
                        self.inner.state.lock().unwrap().total -= 1;
                        self.inner.available.notify_one();
                        return Err(e);
                    }
                },
                Slot::Wait => notified.await,
            }
        }
    }

    /// Drain: refuse new acquisitions and close all idle entries with
    /// `close_pool_size` concurrent close workers. Entries currently held
    /// are closed when their holder releases or discards them.
    pub async fn close(&self) {
        let drained: Vec<C::Conn> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).map(|e| e.conn).collect();
            state.total -= drained.len();
            drained
        };
        self.inner.available.notify_waiters();
        debug!(count = drained.len(), "closing idle upstream connections");
        self.inner.close_all(drained).await;
    }

    /// Idle entries currently pooled.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Outstanding entries, idle and in-use combined.
    pub fn total(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    fn spawn_maintenance(inner: &Arc<PoolInner<C>>) {
        let weak = Arc::downgrade(inner);
        let period = (inner.options.idle_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.maintain().await {
                    break;
                }
            }
        });
    }
}

impl<C: Connector> PoolInner<C> {
    /// One maintenance pass: evict expired idle entries (keeping the warm
    /// floor), then refill idle up to the floor while capacity allows.
    /// Returns true once the pool is closed.
    async fn maintain(&self) -> bool {
        let expired: Vec<C::Conn> = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return true;
            }
            let now = Instant::now();
            let mut expired = Vec::new();
            while state.idle.len() > self.options.min_idle {
                if now.duration_since(state.idle[0].released_at) > self.options.idle_timeout {
                    expired.push(state.idle.remove(0).conn);
                } else {
                    break;
                }
            }
            state.total -= expired.len();
            expired
        };
        if !expired.is_empty() {
            self.stats.bump("idle.evicted", expired.len() as u64);
            debug!(count = expired.len(), "evicted idle upstream connections");
            self.close_all(expired).await;
            self.available.notify_one();
        }

        loop {
            let should_dial = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return true;
                }
                if state.idle.len() < self.options.min_idle
                    && state.total < self.options.max_connections
                {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !should_dial {
                break;
            }
            match self.connector.connect().await {
                Ok(conn) => {
                    let mut state = self.state.lock().unwrap();
                    if state.closed {
                        state.total -= 1;
                        drop(state);
                        drop(conn);
                        return true;
                    }
                    state.idle.push(IdleConn {
                        conn,
                        released_at: Instant::now(),
                    });
                    drop(state);
                    self.stats.bump("idle.refilled", 1);
                    self.available.notify_one();
                }
                Err(e) => {
                    self.state.lock().unwrap().total -= 1;
                    self.available.notify_one();
                    warn!(error = %e, "warm floor dial failed");
                    break;
                }
            }
        }
        false
    }

    fn do_release(&self, conn: C::Conn) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.closed {
                state.idle.push(IdleConn {
                    conn,
                    released_at: Instant::now(),
                });
                drop(state);
                self.stats.bump("release", 1);
                self.available.notify_one();
                return;
            }
        }
        // Release while draining becomes a discard.
        self.do_discard(conn);
    }

    fn do_discard(&self, conn: C::Conn) {
        drop(conn);
        self.state.lock().unwrap().total -= 1;
        self.stats.bump("discard", 1);
        self.available.notify_one();
    }

    async fn close_all(&self, conns: Vec<C::Conn>) {
        let workers = self.options.close_pool_size.max(1);
        stream::iter(conns)
            .for_each_concurrent(workers, |mut conn| async move {
                if let Err(e) = conn.shutdown().await {
                    (self.close_error_handler)(&e);
                }
            })
            .await;
    }
}

/// An upstream entry on loan from the pool. Dropping it without an
/// explicit [`release`](Self::release) counts as a discard, so error paths
/// and aborted tasks can never leak a slot.
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl<C: Connector> PooledConn<C> {
    /// Return a healthy entry to the idle set, timestamped now.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.do_release(conn);
        }
    }

    /// Close a suspect entry and free its capacity slot. Required after
    /// any I/O error observed on the entry.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.do_discard(conn);
        }
    }
}

impl<C: Connector> Deref for PooledConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("pooled connection already taken")
    }
}

impl<C: Connector> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("pooled connection already taken")
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.do_discard(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// Duplex-backed connection with an identity, so tests can tell a
    /// reused entry from a fresh dial.
    struct TestConn {
        id: usize,
        inner: DuplexStream,
    }

    impl AsyncRead for TestConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TestConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    struct TestConnector {
        dialed: AtomicUsize,
        failing: AtomicBool,
    }

    impl TestConnector {
        fn new() -> Self {
            Self {
                dialed: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Connector for Arc<TestConnector> {
        type Conn = TestConn;

        async fn connect(&self) -> ProxyResult<TestConn> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProxyError::ConnectFailed {
                    addr: "test".to_string(),
                });
            }
            let id = self.dialed.fetch_add(1, Ordering::SeqCst);
            let (near, _far) = tokio::io::duplex(16);
            Ok(TestConn { id, inner: near })
        }
    }

    fn options(max: usize, min_idle: usize, idle_timeout: Duration) -> PoolOptions {
        PoolOptions {
            max_connections: max,
            min_idle,
            idle_timeout,
            close_pool_size: 2,
        }
    }

    fn test_pool(max: usize) -> (Pool<Arc<TestConnector>>, Arc<TestConnector>) {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::with_noop_stats(
            Arc::clone(&connector),
            options(max, 0, Duration::from_secs(3600)),
        );
        (pool, connector)
    }

    #[tokio::test]
    async fn test_acquire_dials_then_blocks_at_capacity() {
        let (pool, connector) = test_pool(2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total(), 2);

        // Third acquisition must wait for a release.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        let first_id = first.id;
        first.release();
        let reused = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reused.id, first_id);
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 2);

        reused.release();
        second.release();
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.total(), 2);
    }

    #[tokio::test]
    async fn test_discard_frees_capacity() {
        let (pool, connector) = test_pool(1);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, 0);
        conn.discard();
        assert_eq!(pool.total(), 0);

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(fresh.id, 1);
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_counts_as_discard() {
        let (pool, _connector) = test_pool(1);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_slot() {
        let (pool, connector) = test_pool(1);
        connector.failing.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectFailed { .. }));
        assert_eq!(pool.total(), 0);

        connector.failing.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.total(), 1);
        conn.release();
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let (pool, _connector) = test_pool(2);
        pool.close().await;

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::PoolClosed));
    }

    #[tokio::test]
    async fn test_close_drains_idle_and_release_becomes_discard() {
        let (pool, _connector) = test_pool(2);

        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        idle.release();
        assert_eq!(pool.idle(), 1);

        pool.close().await;
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.total(), 1); // the held entry

        held.release();
        assert_eq!(pool.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_respects_warm_floor() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::with_noop_stats(
            Arc::clone(&connector),
            options(4, 1, Duration::from_millis(100)),
        );

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        a.release();
        b.release();
        c.release();
        assert_eq!(pool.idle(), 3);

        // Let several sweep ticks pass beyond the idle timeout.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_floor_refill() {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::with_noop_stats(
            Arc::clone(&connector),
            options(4, 2, Duration::from_secs(10)),
        );
        assert_eq!(pool.idle(), 0);

        // First sweep tick fills the floor.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_cadence() {
        let attempts = AtomicUsize::new(0);
        let start = Instant::now();

        let result: Option<()> =
            connect_with_retry(DIAL_ATTEMPTS, DIAL_INITIAL_BACKOFF, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                }
            })
            .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 7);
        // Sleeps: 50 + 100 + 200 + 400 + 800 + 1600 + 3200 ms.
        assert_eq!(start.elapsed(), Duration::from_millis(6350));
    }

    #[tokio::test]
    async fn test_server_connector_reports_address() {
        // Dial a port nobody listens on, with retries shrunk out of the
        // picture by pausing after start so the backoff sleeps are instant.
        tokio::time::pause();
        let connector = ServerConnector::new("127.0.0.1:1", None);
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.to_string(), "could not connect to 127.0.0.1:1");
    }
}
