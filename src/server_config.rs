use std::time::Duration;

use crate::socket_listener::ConfigListenAddr;
use crate::LimitsConfig;

/// Default `Server:` header value
pub const SERVER_NAME_DEFAULT: &str = concat!("origin-http/", env!("CARGO_PKG_VERSION"));

/// Declared body size above which a pooled connection is promoted to a
/// dedicated worker thread, so a single slow upload cannot block the pool.
pub(crate) const PROMOTE_BODY_SIZE: i64 = 16 * 1024 * 1024;

/// Represents the config parameters required to create a server.
///
/// # Example
///
/// ```
/// # use origin_http::{ConfigListenAddr, ServerConfig};
/// let cfg = ServerConfig {
///     addr: ConfigListenAddr::parse("127.0.0.1:0").unwrap(),
///     worker_pool_size: 8,
///     ..ServerConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The address to listen on, see [`ConfigListenAddr::parse`].
    pub addr: ConfigListenAddr,

    /// Maximum time the acceptor blocks when the worker-pool queue is full
    /// before the connection is dropped (default 5s)
    pub contention_abort_delay: Duration,

    /// Maximum wall-clock time allowed to finish reading the request headers,
    /// per request. Zero means unlimited (default).
    ///
    /// This is the slowloris mitigation knob.
    pub header_retrieve_abort_delay: Duration,

    /// Idle time after which a kept-alive connection is closed (default 30s).
    ///
    /// Zero disables keep-alive entirely; every response is then written as
    /// HTTP/1.0 with connection close.
    pub keep_alive_timeout: Duration,

    /// Header size budgets, see [`LimitsConfig`]
    pub limits: LimitsConfig,

    /// Largest accepted declared `Content-Length` in bytes.
    /// Zero means unlimited (default); larger requests are answered `413`.
    pub max_content_length: u64,

    /// Capacity of the pending-connection queue in front of the worker pool
    /// (default 1000)
    pub queue_length: usize,

    /// Header whose value replaces the server-assigned connection id
    /// (e.g. `X-Conn-ID` from a front proxy)
    pub remote_conn_id_header: Option<String>,

    /// Header whose value replaces the socket-derived remote IP
    /// (e.g. `X-Real-IP` from a front proxy)
    pub remote_ip_header: Option<String>,

    /// Timeout for each blocking socket read while a request is being parsed
    /// (default 5s)
    pub receive_timeout: Duration,

    /// Value of the `Server:` response header
    pub server_name: String,

    /// Mark every connection as TLS-terminated by a front proxy; propagated
    /// to the hooks as `is_ssl`. No handshake is performed here.
    pub ssl_offloaded: bool,

    /// Sleep applied when the idle peek returns no data again within
    /// [`spin_guard_window`](Self::spin_guard_window). Absorbs spurious
    /// wakeups observed on some platforms (default 1ms).
    pub spin_guard_sleep: Duration,

    /// Window for the spin guard (default 40ms)
    pub spin_guard_window: Duration,

    /// Required first line ahead of every request. Empty disables the check
    /// (default). A configured prefix is also written ahead of every
    /// response's status line.
    pub tcp_prefix: String,

    /// Retain every request header in the header block instead of lifting the
    /// well-known ones into typed fields (default false)
    pub unfiltered_headers: bool,

    /// Number of pool workers processing newly-accepted connections
    /// (clamped to 1..=256, default 32).
    ///
    /// Zero disables the pool; every connection then gets a dedicated thread
    /// immediately.
    pub worker_pool_size: usize,

    /// Optional `X-Powered-By:` response header value
    pub x_powered_by: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ConfigListenAddr::IP(vec![std::net::SocketAddr::new(
                std::net::Ipv4Addr::new(127, 0, 0, 1).into(),
                0,
            )]),
            contention_abort_delay: Duration::from_secs(5),
            header_retrieve_abort_delay: Duration::ZERO,
            keep_alive_timeout: Duration::from_secs(30),
            limits: LimitsConfig::default(),
            max_content_length: 0,
            queue_length: 1000,
            remote_conn_id_header: None,
            remote_ip_header: None,
            receive_timeout: Duration::from_secs(5),
            server_name: SERVER_NAME_DEFAULT.to_owned(),
            ssl_offloaded: false,
            spin_guard_sleep: Duration::from_millis(1),
            spin_guard_window: Duration::from_millis(40),
            tcp_prefix: String::new(),
            unfiltered_headers: false,
            worker_pool_size: 32,
            x_powered_by: None,
        }
    }
}
