//! Request-head and body reading
//!
//! [`RequestParser::read_request`] consumes one request from a buffered
//! stream under the configured size and time budgets and produces either a
//! [`ParsedRequest`] or a typed failure outcome.

use std::io::{BufRead, Error as IoError, ErrorKind as IoErrorKind, Read, Write};
use std::time::Instant;

use ascii::{AsciiChar, AsciiStr, AsciiString};

use crate::context::RequestContext;
use crate::hooks::{BeforeBodyArgs, HookSet};
use crate::log;
use crate::server_config::ServerConfig;
use crate::{Method, StatusCode};

/// Outcome of [`RequestParser::read_request`].
///
/// Every outcome has a matching counter in
/// [`ServerStats`](crate::ServerStats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadRequestResult {
    /// Socket dropped or the request framing is unusable; closed silently
    Error,
    /// Unexpected non-transport failure (e.g. a hook error before the body)
    Exception,
    /// Declared `Content-Length` above the configured maximum, answered `413`
    OversizedPayload,
    /// The `before_body` hook returned non-200, answered with that status
    Rejected,
    /// A read or the header deadline timed out
    Timeout,
    /// Request line and headers are complete, the body is still unread
    HeaderReceived,
    /// Headers and the full body have been read
    BodyReceived,
    /// The connection belongs to an upgrade handler from here on
    Owned,
}

/// A fully or partially (head only) read request plus the connection facts
/// derived from it
pub(crate) struct ParsedRequest {
    pub(crate) ctx: RequestContext,
    /// negotiated for this request: HTTP/1.1 and keep-alive enabled and no
    /// `Connection: close`
    pub(crate) keep_alive: bool,
    pub(crate) upgrade: bool,
    /// declared `Content-Length`, `-1` when absent or unparseable
    pub(crate) content_length: i64,
    pub(crate) accept_encoding: String,
    pub(crate) host: String,
    pub(crate) user_agent: String,
    pub(crate) referer: String,
    /// value of the configured connection-id proxy header
    pub(crate) forwarded_conn_id: Option<u64>,
    pub(crate) body_read: bool,
    pub(crate) bytes_in: u64,
}

pub(crate) struct RequestParser<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
    config: &'a ServerConfig,
    hooks: &'a HookSet,
    remote_ip: String,
    is_ssl: bool,
}

impl<'a, R: BufRead, W: Write> RequestParser<'a, R, W> {
    pub(crate) fn new(
        reader: &'a mut R,
        writer: &'a mut W,
        config: &'a ServerConfig,
        hooks: &'a HookSet,
        remote_ip: String,
        is_ssl: bool,
    ) -> Self {
        Self {
            reader,
            writer,
            config,
            hooks,
            remote_ip,
            is_ssl,
        }
    }

    /// Reads one request.
    ///
    /// With `want_body` the body is consumed as well (unless the connection
    /// upgrades); otherwise reading stops after the head and the caller
    /// finishes with [`read_body`](Self::read_body) later. `deadline` is the
    /// header-retrieve abort point; it is checked once the head is complete,
    /// before any body byte is read.
    pub(crate) fn read_request(
        &mut self,
        want_body: bool,
        deadline: Option<Instant>,
    ) -> (ReadRequestResult, Option<ParsedRequest>) {
        match self.read_request_inner(want_body, deadline) {
            Ok((result, parsed)) => (result, Some(parsed)),
            Err(result) => (result, None),
        }
    }

    fn read_request_inner(
        &mut self,
        want_body: bool,
        deadline: Option<Instant>,
    ) -> Result<(ReadRequestResult, ParsedRequest), ReadRequestResult> {
        let mut head_budget = self.config.limits.header_max_size;

        if !self.config.tcp_prefix.is_empty() {
            let line = self.read_line()?;
            if line.as_str() != self.config.tcp_prefix {
                log::debug!("tcp prefix mismatch");
                return Err(ReadRequestResult::Error);
            }
        }

        let mut parsed = {
            let line = self.read_line()?;
            head_budget = consume_budget(head_budget, line.len())?;
            let mut bytes_in = line.len() as u64 + 2;
            if !self.config.tcp_prefix.is_empty() {
                bytes_in += self.config.tcp_prefix.len() as u64 + 2;
            }
            let (method, url, version) = parse_request_line(line.trim())?;

            let keep_alive = version.as_str() == "HTTP/1.1"
                && !self.config.keep_alive_timeout.is_zero();

            ParsedRequest {
                ctx: RequestContext {
                    url: url.to_string(),
                    method,
                    remote_ip: self.remote_ip.clone(),
                    is_ssl: self.is_ssl,
                    ..RequestContext::default()
                },
                keep_alive,
                upgrade: false,
                content_length: -1,
                accept_encoding: String::new(),
                host: String::new(),
                user_agent: String::new(),
                referer: String::new(),
                forwarded_conn_id: None,
                body_read: false,
                bytes_in,
            }
        };

        loop {
            let line = self.read_line()?;
            head_budget = consume_budget(head_budget, line.len())?;
            parsed.bytes_in += line.len() as u64 + 2;
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            self.store_header(&mut parsed, line)?;
        }

        log::debug!(
            "{} {} host[{}] referer[{}] [{}] ({})",
            parsed.ctx.method,
            parsed.ctx.url,
            parsed.host,
            parsed.referer,
            parsed.ctx.remote_ip,
            parsed.user_agent
        );

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                log::debug!("header retrieve abort");
                return Err(ReadRequestResult::Timeout);
            }
        }

        let max = self.config.max_content_length;
        if max > 0 && parsed.content_length > 0 && parsed.content_length as u64 > max {
            self.send_status(413)?;
            return Err(ReadRequestResult::OversizedPayload);
        }

        if let Some(hook) = &self.hooks.before_body {
            let args = BeforeBodyArgs {
                url: &parsed.ctx.url,
                method: &parsed.ctx.method,
                headers: &parsed.ctx.in_headers,
                content_type: &parsed.ctx.in_content_type,
                remote_ip: &parsed.ctx.remote_ip,
                content_length: parsed.content_length,
                is_ssl: parsed.ctx.is_ssl,
            };
            match hook(&args) {
                Ok(200) => {}
                Ok(code) => {
                    self.send_status(code)?;
                    return Err(ReadRequestResult::Rejected);
                }
                Err(err) => {
                    log::warn!("before_body hook failed: {err}");
                    let _ = err;
                    return Err(ReadRequestResult::Exception);
                }
            }
        }

        if parsed.upgrade && self.hooks.upgrade.is_some() {
            return Ok((ReadRequestResult::Owned, parsed));
        }

        if want_body && !parsed.upgrade {
            self.read_body(&mut parsed)?;
            Ok((ReadRequestResult::BodyReceived, parsed))
        } else {
            Ok((ReadRequestResult::HeaderReceived, parsed))
        }
    }

    /// Consumes the request body according to the declared `Content-Length`.
    ///
    /// A negative length means no body, except for the legacy case of a
    /// non-keep-alive non-GET request, which reads to EOF (old clients omit
    /// the header and close the socket after the body).
    pub(crate) fn read_body(
        &mut self,
        parsed: &mut ParsedRequest,
    ) -> Result<(), ReadRequestResult> {
        if parsed.body_read {
            return Ok(());
        }

        if parsed.content_length > 0 {
            #[allow(clippy::cast_sign_loss)]
            let mut buf = vec![0_u8; parsed.content_length as usize];
            self.reader.read_exact(&mut buf).map_err(|err| {
                log::debug!("body read fail: {err:?}");
                io_failure(&err)
            })?;
            parsed.ctx.in_content = buf;
        } else if parsed.content_length < 0
            && parsed.ctx.method != Method::Get
            && !parsed.keep_alive
        {
            let _ = self
                .reader
                .read_to_end(&mut parsed.ctx.in_content)
                .map_err(|err| {
                    log::debug!("body read fail: {err:?}");
                    io_failure(&err)
                })?;
        }

        parsed.bytes_in += parsed.ctx.in_content.len() as u64;
        parsed.body_read = true;
        Ok(())
    }

    fn store_header(
        &self,
        parsed: &mut ParsedRequest,
        line: &AsciiStr,
    ) -> Result<(), ReadRequestResult> {
        let text = line.as_str();
        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field.trim(), value.trim()),
            None => {
                log::debug!("malformed header line");
                return Err(ReadRequestResult::Error);
            }
        };

        let mut special = true;
        if field.eq_ignore_ascii_case("Content-Length") {
            parsed.content_length = value.parse().unwrap_or(-1);
        } else if field.eq_ignore_ascii_case("Content-Type") {
            parsed.ctx.in_content_type = value.to_owned();
        } else if field.eq_ignore_ascii_case("Content-Encoding") {
            parsed.ctx.in_content_encoding = value.to_owned();
        } else if field.eq_ignore_ascii_case("Connection") {
            let lower = value.to_ascii_lowercase();
            if lower.contains("close") {
                parsed.keep_alive = false;
            } else if lower.contains("upgrade") {
                parsed.upgrade = true;
            }
        } else if field.eq_ignore_ascii_case("Accept-Encoding") {
            parsed.accept_encoding = value.to_owned();
        } else if field.eq_ignore_ascii_case("Host") {
            parsed.host = value.to_owned();
        } else if field.eq_ignore_ascii_case("User-Agent") {
            parsed.user_agent = value.to_owned();
        } else if field.eq_ignore_ascii_case("Referer") {
            parsed.referer = value.to_owned();
        } else if matches_configured(&self.config.remote_ip_header, field) {
            parsed.ctx.remote_ip = value.to_owned();
        } else if matches_configured(&self.config.remote_conn_id_header, field) {
            parsed.forwarded_conn_id = value.parse::<u64>().ok();
        } else {
            special = false;
        }

        if !special || self.config.unfiltered_headers {
            parsed.ctx.in_headers.push_str(text);
            parsed.ctx.in_headers.push_str("\r\n");
        }

        Ok(())
    }

    /// Reads until `CRLF`; the next read starts at the first byte after it.
    /// Each line is capped by the configured line length.
    fn read_line(&mut self) -> Result<AsciiString, ReadRequestResult> {
        let line_cap = self.config.limits.header_line_len;
        let mut buf = Vec::new();
        let mut prev_byte = 0_u8;

        loop {
            let byte = match self.reader.by_ref().bytes().next() {
                Some(Ok(byte)) => byte,
                Some(Err(err)) => {
                    log::debug!("head read fail: {err:?}");
                    return Err(io_failure(&err));
                }
                None => {
                    log::debug!("unexpected connection abort");
                    return Err(ReadRequestResult::Error);
                }
            };

            if byte == b'\n' && prev_byte == b'\r' {
                let _ = buf.pop(); // removing the '\r'
                return AsciiString::from_ascii(buf).map_err(|_| {
                    log::debug!("header no ascii");
                    ReadRequestResult::Error
                });
            }
            prev_byte = byte;

            if buf.len() >= line_cap {
                log::debug!("header line over budget");
                return Err(ReadRequestResult::Error);
            }

            buf.push(byte);
        }
    }

    /// Writes a bare HTTP/1.0 status response and flushes it
    fn send_status(&mut self, code: u16) -> Result<(), ReadRequestResult> {
        let status = StatusCode(code);
        let reason = status.default_reason_phrase();
        write!(
            self.writer,
            "HTTP/1.0 {code} {reason}\r\n\r\n{reason} {code}"
        )
        .and_then(|()| self.writer.flush())
        .map_err(|err| {
            log::debug!("status write fail: {err:?}");
            io_failure(&err)
        })
    }
}

fn consume_budget(budget: usize, line_len: usize) -> Result<usize, ReadRequestResult> {
    budget.checked_sub(line_len + 2).ok_or_else(|| {
        log::debug!("request head over budget");
        ReadRequestResult::Error
    })
}

fn matches_configured(configured: &Option<String>, field: &str) -> bool {
    configured
        .as_deref()
        .map_or(false, |name| field.eq_ignore_ascii_case(name))
}

fn io_failure(err: &IoError) -> ReadRequestResult {
    match err.kind() {
        IoErrorKind::WouldBlock | IoErrorKind::TimedOut => ReadRequestResult::Timeout,
        _ => ReadRequestResult::Error,
    }
}

/// Parses the request line of the request.
/// eg. `GET / HTTP/1.1`
fn parse_request_line(
    line: &AsciiStr,
) -> Result<(Method, AsciiString, AsciiString), ReadRequestResult> {
    let mut parts = line.split(AsciiChar::Space);

    let method = parts.next().map(Method::from);
    let url = parts.next().map(ToOwned::to_owned);
    let version = parts.next().map(ToOwned::to_owned);

    method
        .and_then(|method| Some((method, url?, version?)))
        .ok_or_else(|| {
            log::debug!("malformed request line");
            ReadRequestResult::Error
        })
}
