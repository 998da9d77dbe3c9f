//! Per-request value object handed to the lifecycle hooks

use crate::ids::RequestIds;
use crate::Method;

/// Content-type sentinel: treat the output content as a file path to serve
pub const STATIC_FILE_CONTENT_TYPE: &str = "!STATICFILE";
/// Content-type sentinel: the handler already responded out-of-band
pub const NO_RESPONSE_CONTENT_TYPE: &str = "!NORESPONSE";

/// How the request was authenticated, as recorded by an external
/// authenticator between hooks. The server itself performs no authentication.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthStatus {
    #[default]
    None,
    Failed,
    Basic,
    Digest,
    Ntlm,
    Negotiate,
    Kerberos,
}

/// Carries one request's inputs and outputs between the lifecycle hooks.
///
/// The `in_*` fields are filled by the server while the request is parsed and
/// must be treated as immutable once [`prepare`](Self::prepare) ran; hooks
/// produce the response through the `out_*` fields.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Requested URL as sent on the request line
    pub url: String,
    /// Request method
    pub method: Method,
    /// Header block, CRLF-separated lines, already filtered unless the server
    /// runs with `unfiltered_headers`
    pub in_headers: String,
    /// Request body
    pub in_content: Vec<u8>,
    /// Value of the request `Content-Type` header
    pub in_content_type: String,
    /// Value of the request `Content-Encoding` header
    pub in_content_encoding: String,
    /// Remote IP, either socket-derived or taken from the configured proxy
    /// header
    pub remote_ip: String,
    /// True when a front proxy terminated TLS for this connection
    pub is_ssl: bool,
    /// Authentication state carried for external authenticators
    pub auth_status: AuthStatus,
    /// Authenticated principal, empty when unauthenticated
    pub auth_user: String,

    /// Response body, or a file path under the `!STATICFILE` sentinel
    pub out_content: Vec<u8>,
    /// Response content type, possibly one of the sentinels
    pub out_content_type: String,
    /// Additional response header lines, CRLF- or LF-separated, emitted
    /// verbatim
    pub out_custom_headers: String,

    /// Identifier of the connection this request arrived on
    pub connection_id: u64,
    /// Identifier of this request, assigned by [`prepare`](Self::prepare)
    pub request_id: u32,
}

impl RequestContext {
    /// Finalizes the input side of the context.
    ///
    /// Assigns the request id from `ids` (a server-owned sequence, or
    /// [`RequestIds::global`] when the context has no server) and appends the
    /// remote IP to the header block as a `RemoteIP:` line so downstream
    /// handlers can read it uniformly.
    pub fn prepare(&mut self, ids: &RequestIds) {
        self.request_id = ids.next();

        if !self.remote_ip.is_empty() {
            if !self.in_headers.is_empty() && !self.in_headers.ends_with("\r\n") {
                self.in_headers.push_str("\r\n");
            }
            self.in_headers.push_str("RemoteIP: ");
            self.in_headers.push_str(&self.remote_ip);
            self.in_headers.push_str("\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestContext, RequestIds};

    #[test]
    fn prepare_appends_remote_ip() {
        let ids = RequestIds::new();
        let mut ctx = RequestContext {
            in_headers: "Accept: */*\r\n".to_owned(),
            remote_ip: "9.9.9.9".to_owned(),
            ..RequestContext::default()
        };
        ctx.prepare(&ids);

        assert!(ctx.in_headers.contains("RemoteIP: 9.9.9.9\r\n"));
        assert_eq!(ctx.request_id, 1);
    }

    #[test]
    fn prepare_without_remote_ip() {
        let ids = RequestIds::new();
        let mut ctx = RequestContext::default();
        ctx.prepare(&ids);

        assert!(ctx.in_headers.is_empty());
        assert!(ctx.request_id > 0);
    }

    #[test]
    fn prepare_ids_are_monotonic() {
        let ids = RequestIds::new();
        let mut first = RequestContext::default();
        let mut second = RequestContext::default();
        first.prepare(&ids);
        second.prepare(&ids);

        assert!(second.request_id > first.request_id);
    }
}
