//! # Embeddable HTTP/1.1 origin server
//!
//! ## Creating the server
//!
//! An [`HttpServer`] is configured first and bound later: `execute()` starts
//! a background acceptor, and [`HttpServer::wait_started`] reports whether
//! binding succeeded.
//!
//! ```no_run
//! # use std::time::Duration;
//! let mut server = origin_http::HttpServer::http("0.0.0.0:8080").unwrap();
//! server.execute().unwrap();
//! server.wait_started(Duration::from_secs(5)).unwrap();
//! ```
//!
//! ## Handling requests
//!
//! Requests are dispatched to a table of lifecycle hooks instead of a router:
//! `before_body` runs before the request body is read and can reject early,
//! `before_request`/`request`/`after_request` produce the response through a
//! [`RequestContext`], and `after_response` is notified once the bytes are on
//! the wire.
//!
//! ```no_run
//! # let mut server = origin_http::HttpServer::http("0.0.0.0:0").unwrap();
//! server.set_request(|ctx| {
//!     ctx.out_content = format!("hello from {}", ctx.url).into_bytes();
//!     ctx.out_content_type = "text/plain".to_owned();
//!     Ok(200)
//! }).unwrap();
//! ```
//!
//! A handler can serve a local file by setting the content type to the
//! `!STATICFILE` sentinel and the content to the file path; the file is then
//! read (or delegated to a front proxy via [`AccelRedirect`]) inside the
//! response writer, not in the handler.
//!
//! ## Concurrency model
//!
//! One acceptor thread hands new connections to a fixed worker pool. The
//! pool reads each connection's *first* request head and keeps short-lived
//! connections in place; keep-alive connections and large uploads are
//! promoted to a dedicated thread per connection. Hooks are called from
//! whichever thread owns the current request and must be thread-safe.
//!
//! ## Compression
//!
//! Content encodings are negotiated from an ordered registry; see
//! [`HttpServer::register_compress`], [`gzip_compress`] and
//! [`deflate_compress`]. Registration must precede `execute()`.
//!
//! ## Shutdown
//!
//! [`HttpServer::shutdown`] (also run on drop) unblocks the acceptor with a
//! loopback self-connect, signals every live connection and waits up to 20
//! seconds for the drain. Connections handed off through an upgrade hook are
//! left alone.

pub use common::{limits, LimitsConfig, Method, StatusCode};
pub use connection_stream::ConnectionStream;
pub use context::{AuthStatus, RequestContext, NO_RESPONSE_CONTENT_TYPE, STATIC_FILE_CONTENT_TYPE};
pub use encoding::{deflate_compress, gzip_compress, CompressFn, COMPRESS_MIN_SIZE_DEFAULT};
pub use hooks::{
    AfterResponseHook, BeforeBodyArgs, BeforeBodyHook, HookError, HookResult, HookSet, RequestHook,
    SendFileHook, UpgradeHook,
};
pub use ids::{RequestIds, CONNECTION_ID_MAX, REQUEST_ID_MAX};
pub use parser::ReadRequestResult;
pub use send_file::AccelRedirect;
pub use server::{ExecuteState, HttpServer, ServerError};
pub use server_config::{ServerConfig, SERVER_NAME_DEFAULT};
pub use socket_listener::{ConfigListenAddr, ListenAddr, Listener};
pub use stats::{ServerStats, StatsSnapshot};

mod common;
mod connection;
mod connection_stream;
mod context;
mod encoding;
mod hooks;
mod ids;
mod log;
mod parser;
mod pipeline;
mod response;
mod send_file;
mod server;
mod server_config;
mod socket_listener;
mod stats;
mod worker_pool;
