//! Hook invocation for one request
//!
//! `before_request` runs first, then `request`, then `after_request`, then
//! the response is written and `after_response` notified. A positive non-202
//! `before_request` return short-circuits straight to the response (202
//! explicitly lets the request stage run); a positive `after_request` return
//! overrides the status. A failed hook turns into a 500 carrying the escaped
//! error text, and `after_response` is skipped.

use std::io::{Result as IoResult, Write};

use crate::context::RequestContext;
use crate::hooks::{HookError, HookSet};
use crate::log;
use crate::response::ResponseWriter;

/// Runs `before_request`, `request` and `after_request` for one parsed
/// request and yields the status to answer with.
pub(crate) fn run_hooks(hooks: &HookSet, ctx: &mut RequestContext) -> Result<u16, HookError> {
    let code = match &hooks.before_request {
        Some(hook) => hook(ctx)?,
        None => 0,
    };
    if code > 0 && code != 202 {
        return Ok(code);
    }

    let mut status = match &hooks.request {
        Some(hook) => hook(ctx)?,
        None => 404,
    };

    if let Some(hook) = &hooks.after_request {
        let after = hook(ctx)?;
        if after > 0 {
            status = after;
        }
    }

    Ok(status)
}

/// Writes the response for a hook outcome, then notifies `after_response`.
///
/// Returns the status sent and the bytes put on the wire. An `Err` is a
/// transport failure; the caller closes the connection.
pub(crate) fn write_and_notify<W: Write>(
    hooks: &HookSet,
    ctx: &mut RequestContext,
    writer: &mut ResponseWriter<'_, W>,
    outcome: Result<u16, HookError>,
    keep_alive: bool,
    accept_encoding: &str,
) -> IoResult<(u16, u64)> {
    match outcome {
        Ok(status) => {
            let written = writer.write(ctx, status, None, keep_alive, accept_encoding)?;
            if let Some(hook) = &hooks.after_response {
                hook(ctx, status);
            }
            Ok((status, written))
        }
        Err(err) => {
            log::warn!("handler failed: {err}");
            let written =
                writer.write(ctx, 500, Some(&err.to_string()), keep_alive, accept_encoding)?;
            Ok((500, written))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{run_hooks, write_and_notify};
    use crate::context::RequestContext;
    use crate::encoding::CompressRegistry;
    use crate::hooks::HookSet;
    use crate::response::ResponseWriter;
    use crate::server_config::ServerConfig;

    fn ctx() -> RequestContext {
        RequestContext {
            in_headers: "Accept: */*\r\n".to_owned(),
            ..RequestContext::default()
        }
    }

    fn run_pipeline(hooks: &HookSet, ctx: &mut RequestContext) -> (u16, String) {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, &config, &registry, None);
        let outcome = run_hooks(hooks, ctx);
        let (status, _) = write_and_notify(hooks, ctx, &mut writer, outcome, true, "").unwrap();
        (status, String::from_utf8_lossy(&out).into_owned())
    }

    fn recording(order: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, code: u16) -> crate::hooks::RequestHook {
        let order = Arc::clone(order);
        Arc::new(move |_ctx| {
            order.lock().unwrap().push(name);
            Ok(code)
        })
    }

    #[test]
    fn hooks_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let after_order = Arc::clone(&order);
        let hooks = HookSet {
            before_request: Some(recording(&order, "before_request", 0)),
            request: Some(recording(&order, "request", 200)),
            after_request: Some(recording(&order, "after_request", 0)),
            after_response: Some(Arc::new(move |_, _| {
                after_order.lock().unwrap().push("after_response");
            })),
            ..HookSet::default()
        };

        let (status, _) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 200);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["before_request", "request", "after_request", "after_response"]
        );
    }

    #[test]
    fn no_request_hook_defaults_to_404() {
        let (status, text) = run_pipeline(&HookSet::default(), &mut ctx());
        assert_eq!(status, 404);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn before_request_short_circuit_still_notifies() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let after_order = Arc::clone(&order);
        let hooks = HookSet {
            before_request: Some(recording(&order, "before_request", 403)),
            request: Some(recording(&order, "request", 200)),
            after_request: Some(recording(&order, "after_request", 0)),
            after_response: Some(Arc::new(move |_, status| {
                assert_eq!(status, 403);
                after_order.lock().unwrap().push("after_response");
            })),
            ..HookSet::default()
        };

        let (status, text) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 403);
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        // request and after_request are skipped, after_response still runs
        assert_eq!(
            *order.lock().unwrap(),
            vec!["before_request", "after_response"]
        );
    }

    #[test]
    fn before_request_202_lets_request_run() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookSet {
            before_request: Some(recording(&order, "before_request", 202)),
            request: Some(recording(&order, "request", 201)),
            ..HookSet::default()
        };

        let (status, _) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 201);
        assert_eq!(*order.lock().unwrap(), vec!["before_request", "request"]);
    }

    #[test]
    fn after_request_overrides_status() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookSet {
            request: Some(recording(&order, "request", 200)),
            after_request: Some(recording(&order, "after_request", 503)),
            ..HookSet::default()
        };

        let (status, text) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 503);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[test]
    fn failed_handler_writes_500_and_skips_after_response() {
        let hooks = HookSet {
            request: Some(Arc::new(|_| Err("database <down>".into()))),
            after_response: Some(Arc::new(|_, _| panic!("must not run"))),
            ..HookSet::default()
        };

        let (status, text) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 500);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("database &lt;down&gt;"));
    }

    #[test]
    fn handler_output_reaches_the_wire() {
        let hooks = HookSet {
            request: Some(Arc::new(|ctx| {
                ctx.out_content = b"ok".to_vec();
                ctx.out_content_type = "text/plain".to_owned();
                Ok(200)
            })),
            ..HookSet::default()
        };

        let (status, text) = run_pipeline(&hooks, &mut ctx());

        assert_eq!(status, 200);
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("ok"));
    }
}
