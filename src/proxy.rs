//! The proxy core: accept loop, per-client serve loop, and the message
//! forwarding step.
//!
//! Each accepted client gets its own task. The task admits the client
//! against the per-IP counter, then loops: wait for a message header,
//! borrow an upstream from the pool, forward the exchange, and, when the
//! op was a mutation, keep the same upstream bound to the client for its
//! `getLastError` follow-ups before handing it back.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionControl;
use crate::auth::{Authenticator, Credential, NoAuth};
use crate::conn::{self, AsyncReadWrite, ClientConn};
use crate::error::{ProxyError, ProxyResult};
use crate::pool::{Pool, PoolOptions, PooledConn, ServerConnector};
use crate::query::{LastError, QueryProxy, TransparentQueryProxy};
use crate::stats::{start_timer, NoopStats, PrefixedStats, Stats};
use crate::utils::format_duration;
use crate::wire::{self, MessageHeader, OpCode};

/// TCP keep-alive probe period for client sockets, per the MongoDB
/// diagnostics FAQ.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(120);

const STATS_PREFIX: &str = "portero.";
const POOL_STATS_PREFIX: &str = "portero.server.pool.";

/// Pacing sleep after a non-fatal accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime options. Immutable once the proxy has started.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Address for incoming client connections.
    pub proxy_addr: String,
    /// Address of the destination MongoDB server.
    pub mongo_addr: String,
    /// Upstream pool capacity. Must be > 0.
    pub max_connections: usize,
    /// Concurrent sessions allowed per client IP. Must be > 0.
    pub max_per_client_connections: u32,
    /// Idle upstreams the pool keeps warm.
    pub min_idle_connections: usize,
    /// Idle upstreams older than this are evicted.
    pub server_idle_timeout: Duration,
    /// Concurrency used when draining the pool.
    pub server_close_pool_size: usize,
    /// Deadline over one forwarded exchange, both sockets.
    pub message_timeout: Duration,
    /// How long to wait for the next client header between exchanges.
    pub client_idle_timeout: Duration,
    /// How long to wait for the sticky `getLastError` follow-up.
    pub get_last_error_timeout: Duration,
    /// Upstream credentials; the handshake source is `admin`.
    pub credentials: Option<Credential>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            proxy_addr: "127.0.0.1:27111".to_string(),
            mongo_addr: "127.0.0.1:27017".to_string(),
            max_connections: 100,
            max_per_client_connections: 64,
            min_idle_connections: 5,
            server_idle_timeout: Duration::from_secs(3600),
            server_close_pool_size: 8,
            message_timeout: Duration::from_secs(120),
            client_idle_timeout: Duration::from_secs(3600),
            get_last_error_timeout: Duration::from_millis(150),
            credentials: None,
        }
    }
}

impl ProxyOptions {
    pub fn validate(&self) -> ProxyResult<()> {
        if self.max_connections == 0 {
            return Err(ProxyError::ZeroMaxConnections);
        }
        if self.max_per_client_connections == 0 {
            return Err(ProxyError::ZeroMaxPerClientConnections);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Run,
    Drain,
    Halt,
}

/// Forward one client→server exchange: header and body pass through
/// unchanged, `OpQuery` is delegated to the [`QueryProxy`] collaborator,
/// any other op invalidates a pending `getLastError` context, and ops
/// with responses get one full reply streamed back. The whole exchange
/// runs under a single `message_timeout` deadline covering both sockets.
///
/// On error the caller must discard the upstream entry.
pub async fn proxy_message(
    query_proxy: &dyn QueryProxy,
    message_timeout: Duration,
    header: &MessageHeader,
    client: &mut (dyn AsyncReadWrite),
    server: &mut (dyn AsyncReadWrite),
    last_error: &mut LastError,
) -> ProxyResult<()> {
    let forward = async {
        // OpQuery may need to be transformed to keep the proxy
        // transparent; the collaborator owns that path.
        if header.op_code == OpCode::Query {
            return query_proxy.proxy(header, client, server, last_error).await;
        }

        // Anything besides a getLastError call (which requires an OpQuery)
        // resets the cached context.
        if last_error.exists() {
            info!("reset getLastError cache");
            last_error.reset();
        }

        wire::write_header(server, header).await?;
        wire::copy_exact(client, server, header.body_length()).await?;

        if header.op_code.has_response() {
            wire::copy_message(server, client).await?;
        }
        Ok(())
    };

    match tokio::time::timeout(message_timeout, forward).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::MessageTimeout),
    }
}

struct ProxyServer {
    options: ProxyOptions,
    pool: Pool<ServerConnector>,
    admission: Arc<AdmissionControl>,
    stats: Arc<dyn Stats>,
    query_proxy: Arc<dyn QueryProxy>,
    shutdown: watch::Receiver<Shutdown>,
}

/// The proxy: a listener, an upstream pool, and one serve task per
/// connected client.
pub struct Proxy {
    options: ProxyOptions,
    stats_sink: Arc<dyn Stats>,
    query_proxy: Arc<dyn QueryProxy>,
    authenticator: Arc<dyn Authenticator>,
    shutdown_tx: watch::Sender<Shutdown>,
    server: Option<Arc<ProxyServer>>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proxy {} => mongo {}",
            self.options.proxy_addr, self.options.mongo_addr
        )
    }
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(Shutdown::Run);
        Self {
            options,
            stats_sink: Arc::new(NoopStats),
            query_proxy: Arc::new(TransparentQueryProxy),
            authenticator: Arc::new(NoAuth),
            shutdown_tx,
            server: None,
            local_addr: None,
            accept_task: None,
        }
    }

    /// Install a metrics sink. Proxy metrics are emitted under `portero.`
    /// and pool metrics under `portero.server.pool.`.
    pub fn with_stats(mut self, stats: Arc<dyn Stats>) -> Self {
        self.stats_sink = stats;
        self
    }

    /// Install the `OpQuery` collaborator. Defaults to byte-for-byte
    /// pass-through.
    pub fn with_query_proxy(mut self, query_proxy: Arc<dyn QueryProxy>) -> Self {
        self.query_proxy = query_proxy;
        self
    }

    /// Install the upstream authentication handshake.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Bound address once started. With a `:0` listen address this is the
    /// kernel-assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `(idle, total)` upstream pool occupancy, once started.
    pub fn pool_counts(&self) -> Option<(usize, usize)> {
        self.server
            .as_ref()
            .map(|s| (s.pool.idle(), s.pool.total()))
    }

    /// Whether any client session is currently admitted.
    pub fn has_active_sessions(&self) -> bool {
        self.server
            .as_ref()
            .map(|s| !s.admission.is_empty())
            .unwrap_or(false)
    }

    /// Validate the options, bind the listener, and spawn the accept loop.
    pub async fn start(&mut self) -> ProxyResult<()> {
        self.options.validate()?;

        let listener = TcpListener::bind(&self.options.proxy_addr).await?;
        self.local_addr = Some(listener.local_addr()?);

        let stats: Arc<dyn Stats> = Arc::new(PrefixedStats::new(
            STATS_PREFIX,
            Arc::clone(&self.stats_sink),
        ));
        let pool_stats: Arc<dyn Stats> = Arc::new(PrefixedStats::new(
            POOL_STATS_PREFIX,
            Arc::clone(&self.stats_sink),
        ));

        let connector = ServerConnector::new(
            self.options.mongo_addr.clone(),
            self.options.credentials.clone(),
        )
        .with_authenticator(Arc::clone(&self.authenticator));

        let pool = Pool::new(
            connector,
            PoolOptions {
                max_connections: self.options.max_connections,
                min_idle: self.options.min_idle_connections,
                idle_timeout: self.options.server_idle_timeout,
                close_pool_size: self.options.server_close_pool_size,
            },
            pool_stats,
            Box::new(|e| warn!(error = %e, "upstream close failed")),
        );

        let server = Arc::new(ProxyServer {
            options: self.options.clone(),
            pool,
            admission: Arc::new(AdmissionControl::new(self.options.max_per_client_connections)),
            stats,
            query_proxy: Arc::clone(&self.query_proxy),
            shutdown: self.shutdown_tx.subscribe(),
        });
        self.server = Some(Arc::clone(&server));

        info!("{} listening", self);
        let shutdown = self.shutdown_tx.subscribe();
        self.accept_task = Some(tokio::spawn(accept_loop(server, listener, shutdown)));
        Ok(())
    }

    /// Stop the proxy: close the listener and signal shutdown. A graceful
    /// stop waits for in-flight sessions to drain before closing the
    /// pool; a hard stop tears their sockets down under them.
    pub async fn stop(&mut self, hard: bool) -> ProxyResult<()> {
        let mode = if hard { Shutdown::Halt } else { Shutdown::Drain };
        let _ = self.shutdown_tx.send(mode);

        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if let Some(server) = self.server.take() {
            server.pool.close().await;
        }
        info!("{} stopped", self);
        Ok(())
    }
}

async fn accept_loop(
    server: Arc<ProxyServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<Shutdown>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.spawn(serve_client(Arc::clone(&server), stream, peer));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    // Stop admitting first, then deal with in-flight sessions.
    drop(listener);
    if *shutdown.borrow() == Shutdown::Halt {
        sessions.shutdown().await;
    } else {
        while sessions.join_next().await.is_some() {}
    }
}

async fn serve_client(server: Arc<ProxyServer>, stream: TcpStream, peer: SocketAddr) {
    let Some(_permit) = server.admission.try_acquire(peer.ip()) else {
        server.stats.bump("client.rejected.max.connections", 1);
        warn!(%peer, "rejecting client connection due to max connections limit");
        return;
    };

    if let Err(e) = conn::set_keepalive(&stream, KEEPALIVE_PERIOD) {
        warn!(%peer, error = %e, "could not enable keep-alive");
    }

    let context = format!(
        "client {} <=> proxy {} => mongo {}",
        peer, server.options.proxy_addr, server.options.mongo_addr
    );
    let mut client = conn::tee_if(context, stream);

    server.stats.bump("client.connected", 1);
    debug!(%peer, "client connected");
    let connected_at = Instant::now();

    server.serve_loop(&mut client, peer).await;

    debug!(
        %peer,
        duration = %format_duration(connected_at.elapsed()),
        "client disconnected"
    );
    // Dropping the client closes its socket; dropping the permit
    // decrements the per-IP count.
}

impl ProxyServer {
    /// One client session: IDLE → acquire → forward → (sticky follow-ups)
    /// → release, until the client goes away or a timeout fires.
    async fn serve_loop(&self, client: &mut ClientConn, peer: SocketAddr) {
        let mut last_error = LastError::default();
        loop {
            let mut header = match self.idle_read_header(client).await {
                Ok(header) => header,
                Err(e) => {
                    if !e.is_normal_close() {
                        warn!(%peer, error = %e, "client read failed");
                    }
                    return;
                }
            };

            let mut message_timer = Some(start_timer(&self.stats, "message.proxy.time"));
            let mut server_conn = match self.pool.acquire().await {
                Ok(server_conn) => server_conn,
                Err(e) => {
                    match e {
                        ProxyError::PoolClosed => debug!(%peer, "pool closed during acquire"),
                        _ => error!(%peer, error = %e, "could not acquire upstream"),
                    }
                    return;
                }
            };
            let held_timer = start_timer(&self.stats, "server.conn.held.time");

            loop {
                if let Err(e) = self
                    .forward(&header, client, &mut server_conn, &mut last_error)
                    .await
                {
                    self.stats.bump("message.proxy.error", 1);
                    if e.is_timeout() {
                        self.stats.bump("message.proxy.timeout", 1);
                    }
                    warn!(%peer, error = %e, "proxy message failed");
                    server_conn.discard();
                    return;
                }

                // One message proxied.
                if let Some(timer) = message_timer.take() {
                    timer.stop();
                }

                if !header.op_code.is_mutation() {
                    break;
                }

                // The follow-up to a mutation is possibly a getLastError
                // call, which must reach the same upstream.
                self.stats.bump("message.with.mutation", 1);
                match self.gle_read_header(client).await {
                    Ok(next) => {
                        header = next;
                        message_timer = Some(start_timer(&self.stats, "message.proxy.time"));
                    }
                    Err(ProxyError::ClientReadTimeout) => {
                        // No follow-up came; the sticky window ends and
                        // the upstream is still healthy.
                        break;
                    }
                    Err(e) => {
                        server_conn.release();
                        if !e.is_normal_close() {
                            warn!(%peer, error = %e, "client read failed awaiting follow-up");
                        }
                        return;
                    }
                }
            }

            server_conn.release();
            held_timer.stop();
            self.stats.bump("message.proxy.success", 1);
        }
    }

    async fn forward(
        &self,
        header: &MessageHeader,
        client: &mut ClientConn,
        server_conn: &mut PooledConn<ServerConnector>,
        last_error: &mut LastError,
    ) -> ProxyResult<()> {
        proxy_message(
            self.query_proxy.as_ref(),
            self.options.message_timeout,
            header,
            client,
            &mut **server_conn,
            last_error,
        )
        .await
    }

    async fn idle_read_header(&self, client: &mut ClientConn) -> ProxyResult<MessageHeader> {
        let result = self
            .client_read_header(client, self.options.client_idle_timeout)
            .await;
        if matches!(result, Err(ProxyError::ClientReadTimeout)) {
            self.stats.bump("client.idle.timeout", 1);
        }
        result
    }

    async fn gle_read_header(&self, client: &mut ClientConn) -> ProxyResult<MessageHeader> {
        let result = self
            .client_read_header(client, self.options.get_last_error_timeout)
            .await;
        if matches!(result, Err(ProxyError::ClientReadTimeout)) {
            self.stats.bump("client.gle.timeout", 1);
        }
        result
    }

    /// Wait up to `timeout` for the next client header, while also
    /// watching the shutdown signal. Shutdown while waiting counts as a
    /// normal close, as does a clean end-of-stream.
    async fn client_read_header(
        &self,
        client: &mut ClientConn,
        timeout: Duration,
    ) -> ProxyResult<MessageHeader> {
        let mut shutdown = self.shutdown.clone();
        let err = tokio::select! {
            read = tokio::time::timeout(timeout, wire::read_header(client)) => match read {
                Ok(Ok(header)) => return Ok(header),
                Ok(Err(ProxyError::NormalClose)) => ProxyError::NormalClose,
                Ok(Err(e)) => {
                    self.stats.bump("client.error.disconnect", 1);
                    e
                }
                Err(_) => ProxyError::ClientReadTimeout,
            },
            _ = shutdown.changed() => ProxyError::NormalClose,
        };
        Err(err)
    }
}
