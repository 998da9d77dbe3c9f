//! [`HttpServer`]: acceptor thread, lifecycle and shutdown
//!
//! Binding happens in the background so construction never fails
//! synchronously; [`HttpServer::wait_started`] surfaces bind failures.
//! Shutdown is cooperative: a terminate flag checked at every suspension
//! point, a loopback self-connect to unblock `accept`, and a bounded drain of
//! the live connections.

use std::io::ErrorKind as IoErrorKind;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::connection::{AcceptedConnection, ConnectionWorker};
use crate::connection_stream::ConnectionStream;
use crate::context::RequestContext;
use crate::encoding::{CompressFn, CompressRegistry};
use crate::hooks::{BeforeBodyArgs, HookResult, HookSet, SendFileHook, UpgradeHook};
use crate::ids::{ConnectionIds, RequestIds};
use crate::log;
use crate::server_config::ServerConfig;
use crate::socket_listener::{ConfigListenAddr, ListenAddr};
use crate::stats::ServerStats;
use crate::worker_pool::WorkerPool;

/// How long shutdown waits for live connections to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);
/// Poll interval while draining
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of the background acceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteState {
    /// `execute()` has not been called
    NotStarted,
    /// the acceptor is binding the listen socket
    Binding,
    /// the server accepts connections
    Running,
    /// the acceptor has stopped
    Finished,
}

impl ExecuteState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Binding,
            2 => Self::Running,
            3 => Self::Finished,
            _ => Self::NotStarted,
        }
    }
}

/// Embedder-facing failures
#[derive(Debug)]
pub enum ServerError {
    /// configuration or registration attempted after `execute()`
    AlreadyRunning,
    /// an operation that needs a started server was called before `execute()`
    NotStarted,
    /// the acceptor failed to start; carries the recorded failure text
    Startup(String),
    /// `wait_started` gave up before the server reached `Running`
    StartTimeout,
}

impl std::error::Error for ServerError {}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning => f.write_str("server already running"),
            Self::NotStarted => f.write_str("server not started"),
            Self::Startup(msg) => write!(f, "startup failed: {msg}"),
            Self::StartTimeout => f.write_str("server start timed out"),
        }
    }
}

/// One live connection as seen by shutdown
pub(crate) struct WorkerEntry {
    key: u64,
    stream: ConnectionStream,
}

/// Live-worker list and traffic totals, one critical section for both
#[derive(Default)]
pub(crate) struct LiveRegistry {
    workers: Vec<WorkerEntry>,
    bytes_in: u64,
    bytes_out: u64,
}

/// State shared between the embedder handle, the acceptor and the workers
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) hooks: HookSet,
    pub(crate) compress: CompressRegistry,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) request_ids: RequestIds,
    pub(crate) terminated: AtomicBool,
    conn_ids: ConnectionIds,
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
    listen_addr: Mutex<Option<ListenAddr>>,
    live: Mutex<LiveRegistry>,
}

impl ServerShared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.conn_ids.next()
    }

    pub(crate) fn register_worker(&self, key: u64, stream: ConnectionStream) {
        if let Ok(mut live) = self.live.lock() {
            live.workers.push(WorkerEntry { key, stream });
        }
    }

    pub(crate) fn unregister_worker(&self, key: u64, bytes_in: u64, bytes_out: u64) {
        if let Ok(mut live) = self.live.lock() {
            live.bytes_in += bytes_in;
            live.bytes_out += bytes_out;
            if let Some(pos) = live.workers.iter().position(|w| w.key == key) {
                let _ = live.workers.swap_remove(pos);
            }
        }
    }

    fn set_state(&self, state: ExecuteState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn execute_state(&self) -> ExecuteState {
        ExecuteState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Embeddable HTTP/1.1 origin server.
///
/// Configure hooks and codecs first, then [`execute`](Self::execute) to bind
/// and accept in the background:
///
/// ```no_run
/// use std::time::Duration;
/// use origin_http::HttpServer;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = HttpServer::http("127.0.0.1:8080")?;
/// server.set_request(|ctx| {
///     ctx.out_content = b"hello".to_vec();
///     ctx.out_content_type = "text/plain".to_owned();
///     Ok(200)
/// })?;
/// server.execute()?;
/// server.wait_started(Duration::from_secs(5))?;
/// // ...
/// server.shutdown();
/// # Ok(())
/// # }
/// ```
#[allow(missing_debug_implementations)]
pub struct HttpServer {
    config: ServerConfig,
    hooks: HookSet,
    compress: CompressRegistry,
    stats: Arc<ServerStats>,
    shared: Option<Arc<ServerShared>>,
    pool: Option<WorkerPool>,
    acceptor_jh: Option<thread::JoinHandle<()>>,
}

impl HttpServer {
    /// Creates a server from a config. Nothing is bound yet.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            hooks: HookSet::default(),
            compress: CompressRegistry::default(),
            stats: Arc::new(ServerStats::default()),
            shared: None,
            pool: None,
            acceptor_jh: None,
        }
    }

    /// Shortcut for a server on a port/address string, see
    /// [`ConfigListenAddr::parse`].
    ///
    /// # Errors
    ///
    /// `std::io::Error` when `port` is no usable address
    pub fn http(port: &str) -> std::io::Result<Self> {
        Ok(Self::new(ServerConfig {
            addr: ConfigListenAddr::parse(port)?,
            ..ServerConfig::default()
        }))
    }

    /// The early-rejection hook, runs before the request body is read.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_before_body<F>(&mut self, hook: F) -> Result<(), ServerError>
    where
        F: Fn(&BeforeBodyArgs<'_>) -> HookResult + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        self.hooks.before_body = Some(Arc::new(hook));
        Ok(())
    }

    /// First request-stage hook; a positive non-202 return short-circuits the
    /// main handler.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_before_request<F>(&mut self, hook: F) -> Result<(), ServerError>
    where
        F: Fn(&mut RequestContext) -> HookResult + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        self.hooks.before_request = Some(Arc::new(hook));
        Ok(())
    }

    /// The main request handler. Without one every request is answered `404`.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_request<F>(&mut self, hook: F) -> Result<(), ServerError>
    where
        F: Fn(&mut RequestContext) -> HookResult + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        self.hooks.request = Some(Arc::new(hook));
        Ok(())
    }

    /// Runs after the main handler; a positive return overrides the status.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_after_request<F>(&mut self, hook: F) -> Result<(), ServerError>
    where
        F: Fn(&mut RequestContext) -> HookResult + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        self.hooks.after_request = Some(Arc::new(hook));
        Ok(())
    }

    /// Notification after the response has been flushed, best-effort.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_after_response<F>(&mut self, hook: F) -> Result<(), ServerError>
    where
        F: Fn(&RequestContext, u16) + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        self.hooks.after_response = Some(Arc::new(hook));
        Ok(())
    }

    /// Send-file strategy for `!STATICFILE` responses, e.g.
    /// [`AccelRedirect`](crate::AccelRedirect).
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_send_file(&mut self, hook: SendFileHook) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        self.hooks.send_file = Some(hook);
        Ok(())
    }

    /// Ownership hand-off for `Connection: upgrade` requests. With a hook
    /// installed such connections are detached and never closed here.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn set_upgrade(&mut self, hook: UpgradeHook) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        self.hooks.upgrade = Some(hook);
        Ok(())
    }

    /// Registers a content-encoding codec. Codec order is registration order
    /// and the first registered match wins. Registration must precede
    /// [`execute`](Self::execute).
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyRunning`] once `execute()` was called
    pub fn register_compress<F>(
        &mut self,
        name: &str,
        codec: F,
        min_size: usize,
    ) -> Result<(), ServerError>
    where
        F: Fn(&[u8]) -> std::io::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.ensure_not_running()?;
        let codec: CompressFn = Arc::new(codec);
        self.compress.register(name, codec, min_size);
        Ok(())
    }

    /// Starts the acceptor in the background. Binding happens there; check
    /// the result with [`wait_started`](Self::wait_started).
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyRunning`] on a second call
    /// - [`ServerError::Startup`] when the acceptor thread cannot be spawned
    pub fn execute(&mut self) -> Result<(), ServerError> {
        self.ensure_not_running()?;

        let shared = Arc::new(ServerShared {
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            compress: self.compress.clone(),
            stats: Arc::clone(&self.stats),
            request_ids: RequestIds::new(),
            terminated: AtomicBool::new(false),
            conn_ids: ConnectionIds::new(),
            state: AtomicU8::new(ExecuteState::NotStarted as u8),
            last_error: Mutex::new(None),
            listen_addr: Mutex::new(None),
            live: Mutex::new(LiveRegistry::default()),
        });

        let pool = if self.config.worker_pool_size > 0 {
            Some(WorkerPool::new(Arc::clone(&shared)))
        } else {
            None
        };

        let loop_shared = Arc::clone(&shared);
        let loop_pool = pool.clone();
        let jh = thread::Builder::new()
            .name("acceptor".to_owned())
            .spawn(move || acceptor_loop(&loop_shared, loop_pool.as_ref()))
            .map_err(|err| ServerError::Startup(err.to_string()))?;

        self.shared = Some(shared);
        self.pool = pool;
        self.acceptor_jh = Some(jh);
        Ok(())
    }

    /// Polls the execute state until the server is `Running`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotStarted`] before `execute()`
    /// - [`ServerError::Startup`] when binding failed; carries the recorded
    ///   failure text
    /// - [`ServerError::StartTimeout`] when `timeout` elapsed first
    pub fn wait_started(&self, timeout: Duration) -> Result<(), ServerError> {
        let shared = self.shared.as_ref().ok_or(ServerError::NotStarted)?;
        let deadline = Instant::now() + timeout;

        loop {
            match shared.execute_state() {
                ExecuteState::Running => return Ok(()),
                ExecuteState::Finished => {
                    let msg = shared
                        .last_error
                        .lock()
                        .ok()
                        .and_then(|guard| guard.clone())
                        .unwrap_or_else(|| "acceptor finished before start".to_owned());
                    return Err(ServerError::Startup(msg));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ServerError::StartTimeout);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Current lifecycle state of the acceptor
    #[must_use]
    pub fn execute_state(&self) -> ExecuteState {
        self.shared
            .as_ref()
            .map_or(ExecuteState::NotStarted, |shared| shared.execute_state())
    }

    /// The bound listen address, available once `Running`
    #[must_use]
    pub fn server_addr(&self) -> Option<ListenAddr> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.listen_addr.lock().ok().and_then(|guard| guard.clone()))
    }

    /// Operational counters
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Total `(bytes_in, bytes_out)` over all finished requests
    #[must_use]
    pub fn traffic(&self) -> (u64, u64) {
        self.shared
            .as_ref()
            .and_then(|shared| {
                shared
                    .live
                    .lock()
                    .ok()
                    .map(|live| (live.bytes_in, live.bytes_out))
            })
            .unwrap_or((0, 0))
    }

    /// Stops the server: unblocks the acceptor, signals every live
    /// connection, waits up to 20 s for the drain, then tears the pool down.
    /// Connections handed off to an upgrade hook are not touched.
    pub fn shutdown(&mut self) {
        let shared = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => return,
        };

        if !shared.terminated.swap(true, Ordering::AcqRel) {
            self.unblock_accept(&shared);

            // ask every live worker to stop by dropping its socket
            if let Ok(live) = shared.live.lock() {
                for worker in &live.workers {
                    let _ = worker.stream.shutdown(Shutdown::Both);
                }
            }

            let deadline = Instant::now() + DRAIN_TIMEOUT;
            loop {
                let pending = shared
                    .live
                    .lock()
                    .map(|live| live.workers.len())
                    .unwrap_or(0);
                if pending == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    log::warn!("drain timeout, {pending} connection(s) left");
                    break;
                }
                thread::sleep(DRAIN_POLL);
            }

            if let Some(pool) = &self.pool {
                pool.shutdown();
            }

            log::info!("server stopped");
        }

        if let Some(jh) = self.acceptor_jh.take() {
            let _ = jh.join();
        }
    }

    /// Connect briefly to ourselves to unblock a pending `accept`
    fn unblock_accept(&self, shared: &ServerShared) {
        let addr = shared
            .listen_addr
            .lock()
            .ok()
            .and_then(|guard| guard.clone());

        match addr {
            Some(ListenAddr::IP(addr)) => {
                let unblock = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
                if let Ok(stream) = TcpStream::connect_timeout(&unblock, Duration::from_millis(500))
                {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
            #[cfg(unix)]
            Some(ListenAddr::Unix(addr)) => {
                if let Some(path) = addr.as_pathname() {
                    if let Ok(stream) = std::os::unix::net::UnixStream::connect(path) {
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                    let _ = std::fs::remove_file(path);
                }
            }
            None => {}
        }
    }

    fn ensure_not_running(&self) -> Result<(), ServerError> {
        if self.shared.is_some() {
            Err(ServerError::AlreadyRunning)
        } else {
            Ok(())
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn acceptor_loop(shared: &Arc<ServerShared>, pool: Option<&WorkerPool>) {
    shared.set_state(ExecuteState::Binding);

    let listener = match shared.config.addr.bind() {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("bind fail: {err}");
            if let Ok(mut last) = shared.last_error.lock() {
                *last = Some(err.to_string());
            }
            shared.set_state(ExecuteState::Finished);
            return;
        }
    };

    if let Ok(addr) = listener.local_addr() {
        log::info!("listening on {addr}");
        if let Ok(mut slot) = shared.listen_addr.lock() {
            *slot = Some(addr);
        }
    }
    shared.set_state(ExecuteState::Running);

    while !shared.terminated.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if shared.terminated.load(Ordering::Acquire) {
                    // late wakeup, usually the shutdown self-connect
                    drop(stream);
                    break;
                }
                shared.stats.on_connect();
                let remote_ip = addr.map_or_else(String::new, |a| a.ip().to_string());
                dispatch(shared, pool, AcceptedConnection { stream, remote_ip });
            }
            Err(err)
                if err.kind() == IoErrorKind::WouldBlock
                    || err.kind() == IoErrorKind::TimedOut =>
            {
                // inherited sockets carry a receive timeout so a pending
                // accept observes shutdown periodically
            }
            Err(err) => {
                if shared.terminated.load(Ordering::Acquire) {
                    break;
                }
                log::error!("accept fail: {err:?}");
                let _ = err;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[cfg(unix)]
    if let ConfigListenAddr::Unix(path) = &shared.config.addr {
        let _ = std::fs::remove_file(path);
    }

    drop(listener);
    shared.set_state(ExecuteState::Finished);
    log::debug!("acceptor finished");
}

fn dispatch(shared: &Arc<ServerShared>, pool: Option<&WorkerPool>, conn: AcceptedConnection) {
    if let Some(pool) = pool {
        if !pool.push(conn, true) {
            shared.stats.on_disconnect();
        }
        return;
    }

    match ConnectionWorker::new(Arc::clone(shared), conn) {
        Ok(worker) => {
            if let Err(err) = thread::Builder::new().spawn(move || worker.run(None)) {
                log::error!("worker spawn fail: {err:?}");
                let _ = err;
            }
        }
        Err(err) => {
            log::debug!("connection setup fail: {err:?}");
            shared.stats.on_disconnect();
        }
    }
}
