//! Response composition and writing
//!
//! [`ResponseWriter::write`] emits one complete HTTP response (status line,
//! headers, negotiated content encoding, body) atomically from the caller's
//! perspective: nothing else writes to the connection while it runs.

use std::io::{Result as IoResult, Write};

use crate::context::{RequestContext, NO_RESPONSE_CONTENT_TYPE, STATIC_FILE_CONTENT_TYPE};
use crate::encoding::CompressRegistry;
use crate::hooks::SendFileHook;
use crate::log;
use crate::server_config::ServerConfig;
use crate::StatusCode;

pub(crate) struct ResponseWriter<'a, W> {
    writer: &'a mut W,
    config: &'a ServerConfig,
    registry: &'a CompressRegistry,
    send_file: Option<&'a SendFileHook>,
}

impl<'a, W: Write> ResponseWriter<'a, W> {
    pub(crate) fn new(
        writer: &'a mut W,
        config: &'a ServerConfig,
        registry: &'a CompressRegistry,
        send_file: Option<&'a SendFileHook>,
    ) -> Self {
        Self {
            writer,
            config,
            registry,
            send_file,
        }
    }

    /// Writes the response for `ctx` and flushes it.
    ///
    /// Returns the number of bytes put on the wire. The status actually sent
    /// is stored back through the return value of the pipeline; `ctx` keeps
    /// the (possibly encoded) body for post-response hooks.
    pub(crate) fn write(
        &mut self,
        ctx: &mut RequestContext,
        status: u16,
        error_detail: Option<&str>,
        keep_alive: bool,
        accept_encoding: &str,
    ) -> IoResult<u64> {
        let mut status = status;
        let mut error_detail = error_detail.map(ToOwned::to_owned);

        if ctx.out_content_type == STATIC_FILE_CONTENT_TYPE {
            ctx.out_content_type.clear();
            let handled = match self.send_file {
                Some(hook) => hook(ctx),
                None => false,
            };
            if !handled {
                let path = String::from_utf8_lossy(&ctx.out_content).into_owned();
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        ctx.out_content = bytes;
                        extract_content_type(ctx);
                    }
                    Err(err) => {
                        log::warn!("static file {path}: {err}");
                        status = 404;
                        error_detail = Some(format!("static file {path}: {err}"));
                    }
                }
            }
        }

        if ctx.out_content_type == NO_RESPONSE_CONTENT_TYPE {
            // true HTTP always responds
            ctx.out_content_type.clear();
        }

        if status < 200 || ctx.in_headers.is_empty() {
            status = 404;
        }

        if let Some(detail) = &error_detail {
            let server = &self.config.server_name;
            let reason = StatusCode(status).default_reason_phrase();
            let escaped = html_escape(detail);
            ctx.out_content = format!(
                "<!DOCTYPE html><html><body>\
                 <h1>{server} Server Error {status}</h1>\
                 <h2>{status} {reason}</h2>\
                 <p>{escaped}</p>\
                 <hr><small>{server}</small>\
                 </body></html>"
            )
            .into_bytes();
            ctx.out_content_type = "text/html; charset=utf-8".to_owned();
            ctx.out_custom_headers.clear();
        }

        let mut head = String::with_capacity(256);

        if !self.config.tcp_prefix.is_empty() {
            head.push_str(&self.config.tcp_prefix);
            head.push_str("\r\n");
        }

        let reason = StatusCode(status).default_reason_phrase();
        let version = if keep_alive { "HTTP/1.1" } else { "HTTP/1.0" };
        head.push_str(version);
        head.push(' ');
        head.push_str(&status.to_string());
        head.push(' ');
        head.push_str(reason);
        head.push_str("\r\n");

        let mut compression_allowed = true;
        for line in ctx.out_custom_headers.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if starts_with_ignore_case(line, "Content-Encoding:") {
                // the handler encoded the body itself
                compression_allowed = false;
            }
            head.push_str(line);
            head.push_str("\r\n");
        }

        if let Some(powered_by) = &self.config.x_powered_by {
            head.push_str("X-Powered-By: ");
            head.push_str(powered_by);
            head.push_str("\r\n");
        }
        head.push_str("Server: ");
        head.push_str(&self.config.server_name);
        head.push_str("\r\n");

        let mut content = std::mem::take(&mut ctx.out_content);
        if compression_allowed {
            if let Some(entry) = self.registry.negotiate(accept_encoding, content.len()) {
                content = (entry.codec)(&content)?;
                head.push_str("Content-Encoding: ");
                head.push_str(&entry.name);
                head.push_str("\r\n");
            }
        }

        head.push_str("Content-Length: ");
        head.push_str(&content.len().to_string());
        head.push_str("\r\n");
        if !ctx.out_content_type.is_empty() {
            head.push_str("Content-Type: ");
            head.push_str(&ctx.out_content_type);
            head.push_str("\r\n");
        }

        if keep_alive {
            if !self.registry.is_empty() {
                head.push_str("Accept-Encoding: ");
                head.push_str(self.registry.advertisement());
                head.push_str("\r\n");
            }
            head.push_str("Connection: Keep-Alive\r\n\r\n");
        } else {
            head.push_str("\r\n");
        }

        self.writer.write_all(head.as_bytes())?;
        self.writer.write_all(&content)?;
        self.writer.flush()?;

        let written = head.len() as u64 + content.len() as u64;
        ctx.out_content = content;

        Ok(written)
    }
}

/// Moves a `Content-Type:` line embedded in the custom headers into the
/// context's content-type field
fn extract_content_type(ctx: &mut RequestContext) {
    let mut remaining = String::with_capacity(ctx.out_custom_headers.len());

    for line in ctx.out_custom_headers.lines() {
        let line = line.trim_end();
        match strip_prefix_ignore_case(line, "Content-Type:") {
            Some(value) if ctx.out_content_type.is_empty() => {
                ctx.out_content_type = value.trim().to_owned();
            }
            _ => {
                if !line.is_empty() {
                    remaining.push_str(line);
                    remaining.push_str("\r\n");
                }
            }
        }
    }

    ctx.out_custom_headers = remaining;
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if starts_with_ignore_case(line, prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{html_escape, ResponseWriter};
    use crate::context::RequestContext;
    use crate::encoding::{deflate_compress, gzip_compress, CompressRegistry};
    use crate::send_file::AccelRedirect;
    use crate::server_config::ServerConfig;

    fn ctx_with_headers() -> RequestContext {
        RequestContext {
            in_headers: "Accept: */*\r\n".to_owned(),
            ..RequestContext::default()
        }
    }

    fn write_to_string(
        ctx: &mut RequestContext,
        status: u16,
        detail: Option<&str>,
        keep_alive: bool,
        accept_encoding: &str,
        config: &ServerConfig,
        registry: &CompressRegistry,
    ) -> String {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, config, registry, None);
        let _ = writer
            .write(ctx, status, detail, keep_alive, accept_encoding)
            .unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn keep_alive_response_headers() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();
        ctx.out_content = b"ok".to_vec();
        ctx.out_content_type = "text/plain".to_owned();

        let text = write_to_string(&mut ctx, 200, None, true, "", &config, &registry);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Connection: Keep-Alive\r\n\r\n"));
        assert!(text.ends_with("ok"));
    }

    #[test]
    fn close_response_is_http10() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();

        let text = write_to_string(&mut ctx, 404, None, false, "", &config, &registry);

        assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(!text.contains("Connection:"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn status_below_200_is_floored_to_404() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();

        let text = write_to_string(&mut ctx, 100, None, false, "", &config, &registry);
        assert!(text.starts_with("HTTP/1.0 404 "));
    }

    #[test]
    fn empty_request_headers_force_404() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = RequestContext::default();

        let text = write_to_string(&mut ctx, 200, None, false, "", &config, &registry);
        assert!(text.starts_with("HTTP/1.0 404 "));
    }

    #[test]
    fn error_page_is_escaped_html() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();
        ctx.out_custom_headers = "X-Trace: abc\r\n".to_owned();

        let text = write_to_string(
            &mut ctx,
            500,
            Some("boom <tag> & \"quote\""),
            false,
            "",
            &config,
            &registry,
        );

        assert!(text.starts_with("HTTP/1.0 500 Internal Server Error\r\n"));
        assert!(text.contains("Server Error 500"));
        assert!(text.contains("boom &lt;tag&gt; &amp; &quot;quote&quot;"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
        // custom headers are dropped on error pages
        assert!(!text.contains("X-Trace"));
    }

    #[test]
    fn compression_picks_first_registered() {
        let config = ServerConfig::default();
        let mut registry = CompressRegistry::default();
        registry.register("gzip", Arc::new(gzip_compress), 1024);
        registry.register("deflate", Arc::new(deflate_compress), 512);

        let mut ctx = ctx_with_headers();
        ctx.out_content = vec![b'x'; 2048];

        let text = write_to_string(&mut ctx, 200, None, true, "deflate, gzip", &config, &registry);

        assert!(text.contains("Content-Encoding: gzip\r\n"));
        assert!(text.contains("Accept-Encoding: gzip,deflate\r\n"));
        // body was re-framed to the encoded length
        let encoded_len = ctx.out_content.len();
        assert!(encoded_len < 2048);
        assert!(text.contains(&format!("Content-Length: {encoded_len}\r\n")));
    }

    #[test]
    fn custom_content_encoding_suppresses_compression() {
        let config = ServerConfig::default();
        let mut registry = CompressRegistry::default();
        registry.register("gzip", Arc::new(gzip_compress), 16);

        let mut ctx = ctx_with_headers();
        ctx.out_content = vec![b'x'; 2048];
        ctx.out_custom_headers = "content-encoding: br\r\n".to_owned();

        let text = write_to_string(&mut ctx, 200, None, true, "gzip, br", &config, &registry);

        assert!(text.contains("content-encoding: br\r\n"));
        assert!(!text.contains("Content-Encoding: gzip"));
        assert!(text.contains("Content-Length: 2048\r\n"));
    }

    #[test]
    fn static_file_sentinel_reads_file() {
        let dir = std::env::temp_dir().join("origin-http-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.bin");
        std::fs::write(&path, vec![7_u8; 100]).unwrap();

        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();
        ctx.out_content = path.to_string_lossy().into_owned().into_bytes();
        ctx.out_content_type = "!STATICFILE".to_owned();
        ctx.out_custom_headers = "Content-Type: application/octet-stream\r\n".to_owned();

        let text = write_to_string(&mut ctx, 200, None, false, "", &config, &registry);

        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 100\r\n"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert_eq!(ctx.out_content, vec![7_u8; 100]);
    }

    #[test]
    fn static_file_missing_becomes_404() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();
        ctx.out_content = b"/no/such/file".to_vec();
        ctx.out_content_type = "!STATICFILE".to_owned();

        let text = write_to_string(&mut ctx, 200, None, false, "", &config, &registry);

        assert!(text.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(text.contains("Server Error 404"));
    }

    #[test]
    fn send_file_hook_short_circuits_read() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let hook = AccelRedirect::new(["/var/www"]).into_hook();

        let mut ctx = ctx_with_headers();
        ctx.out_content = b"/var/www/data/a.bin".to_vec();
        ctx.out_content_type = "!STATICFILE".to_owned();

        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out, &config, &registry, Some(&hook));
        let _ = writer.write(&mut ctx, 200, None, false, "").unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.contains("X-Accel-Redirect: /data/a.bin\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn no_response_sentinel_is_cleared() {
        let config = ServerConfig::default();
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();
        ctx.out_content_type = "!NORESPONSE".to_owned();

        let text = write_to_string(&mut ctx, 200, None, false, "", &config, &registry);

        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!text.contains("NORESPONSE"));
        assert!(!text.contains("Content-Type:"));
    }

    #[test]
    fn tcp_prefix_precedes_status_line() {
        let config = ServerConfig {
            tcp_prefix: "MAGIC".to_owned(),
            ..ServerConfig::default()
        };
        let registry = CompressRegistry::default();
        let mut ctx = ctx_with_headers();

        let text = write_to_string(&mut ctx, 200, None, false, "", &config, &registry);
        assert!(text.starts_with("MAGIC\r\nHTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn escape_handles_all_specials() {
        assert_eq!(html_escape("a&b<c>d\"e"), "a&amp;b&lt;c&gt;d&quot;e");
    }
}
