//! Lifecycle hook table
//!
//! Hooks are plain function references on the server value; an unset entry is
//! skipped. All hooks may be invoked from several worker threads at once and
//! must be thread-safe.

use std::sync::Arc;

use crate::connection_stream::ConnectionStream;
use crate::context::RequestContext;
use crate::Method;

/// Error type hooks may fail with; the server answers `500` with the escaped
/// error text
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Status result of the request-stage hooks
pub type HookResult = Result<u16, HookError>;

/// Inputs offered to the [`before_body`](HookSet::before_body) hook, available
/// before any body byte has been read
#[allow(missing_docs)]
#[derive(Debug)]
pub struct BeforeBodyArgs<'a> {
    pub url: &'a str,
    pub method: &'a Method,
    /// Header block as received (already filtered)
    pub headers: &'a str,
    pub content_type: &'a str,
    pub remote_ip: &'a str,
    /// Declared `Content-Length`, `-1` when absent
    pub content_length: i64,
    pub is_ssl: bool,
}

/// Early-rejection hook, runs between header and body reading.
/// Any return other than `200` rejects the request before its body is read.
pub type BeforeBodyHook = Arc<dyn Fn(&BeforeBodyArgs<'_>) -> HookResult + Send + Sync>;

/// Request-stage hook operating on a [`RequestContext`]
pub type RequestHook = Arc<dyn Fn(&mut RequestContext) -> HookResult + Send + Sync>;

/// Post-response notification hook, best-effort, no return
pub type AfterResponseHook = Arc<dyn Fn(&RequestContext, u16) + Send + Sync>;

/// Send-file strategy consulted for `!STATICFILE` responses.
/// Returns true when it fully took care of the body (headers rewritten,
/// content cleared); false lets the server read the file itself.
pub type SendFileHook = Arc<dyn Fn(&mut RequestContext) -> bool + Send + Sync>;

/// Ownership hand-off target for upgraded connections. Receives the parsed
/// request and the raw stream; the server is out of the picture afterwards.
pub type UpgradeHook = Arc<dyn Fn(RequestContext, ConnectionStream) + Send + Sync>;

/// The hook table. `None` entries are skipped.
#[derive(Default, Clone)]
pub struct HookSet {
    /// Runs after headers, before the body is read
    pub before_body: Option<BeforeBodyHook>,
    /// Runs first per request; a positive non-202 return short-circuits
    /// [`request`](Self::request)
    pub before_request: Option<RequestHook>,
    /// The main handler; absent means every request is answered `404`
    pub request: Option<RequestHook>,
    /// Runs after [`request`](Self::request); a positive return overrides the
    /// status
    pub after_request: Option<RequestHook>,
    /// Runs after the response has been flushed
    pub after_response: Option<AfterResponseHook>,
    /// Send-file strategy for `!STATICFILE` responses
    pub send_file: Option<SendFileHook>,
    /// Takes ownership of `Connection: upgrade` requests
    pub upgrade: Option<UpgradeHook>,
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("before_body", &self.before_body.is_some())
            .field("before_request", &self.before_request.is_some())
            .field("request", &self.request.is_some())
            .field("after_request", &self.after_request.is_some())
            .field("after_response", &self.after_response.is_some())
            .field("send_file", &self.send_file.is_some())
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}
