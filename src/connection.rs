//! Per-connection worker
//!
//! A [`ConnectionWorker`] owns exactly one client socket for the connection's
//! lifetime: it waits for request data, parses, runs the hook pipeline,
//! writes the response, and repeats while keep-alive holds. Ownership leaves
//! the worker only through [`detach`](ConnectionWorker::detach), after which
//! the worker never touches the socket again.

use std::io::{BufRead, BufReader, BufWriter, ErrorKind as IoErrorKind, Result as IoResult, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection_stream::ConnectionStream;
use crate::context::RequestContext;
use crate::log;
use crate::parser::{ParsedRequest, ReadRequestResult, RequestParser};
use crate::pipeline;
use crate::response::ResponseWriter;
use crate::server::ServerShared;

/// Interval of the idle data peek while waiting for the next request
const PEEK_INTERVAL: Duration = Duration::from_millis(50);

/// An accepted client socket on its way to a worker
pub(crate) struct AcceptedConnection {
    pub(crate) stream: ConnectionStream,
    pub(crate) remote_ip: String,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    ReadingHeaders,
    AwaitingBody,
    Handling,
    Writing,
    KeepAliveWait,
    Closing,
    /// Terminal: the socket belongs to an external subsystem
    Owned,
}

pub(crate) struct ConnectionWorker {
    shared: Arc<ServerShared>,
    reader: BufReader<ConnectionStream>,
    /// `None` once the stream has been detached; the worker then must not
    /// close the socket
    writer: Option<BufWriter<ConnectionStream>>,
    /// current connection id, possibly inherited from the configured proxy
    /// header
    connection_id: u64,
    /// server-assigned id, stable key in the live-worker registry
    key: u64,
    remote_ip: String,
    state: WorkerState,
    bytes_in: u64,
    bytes_out: u64,
}

impl ConnectionWorker {
    /// Takes ownership of an accepted socket and registers the connection.
    pub(crate) fn new(shared: Arc<ServerShared>, conn: AcceptedConnection) -> IoResult<Self> {
        let key = shared.next_connection_id();
        let read_half = conn.stream.try_clone()?;
        let registry_half = conn.stream.try_clone()?;
        conn.stream
            .set_read_timeout(Some(shared.config.receive_timeout))?;

        shared.register_worker(key, registry_half);
        log::debug!("connection [{key}] from [{}]", conn.remote_ip);

        Ok(Self {
            shared,
            reader: BufReader::with_capacity(1024, read_half),
            writer: Some(BufWriter::with_capacity(1024, conn.stream)),
            connection_id: key,
            key,
            remote_ip: conn.remote_ip,
            state: WorkerState::ReadingHeaders,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Reads the first request head only; used by the pool to decide between
    /// staying pooled and promotion. The outcome is counted in the stats.
    pub(crate) fn read_first(&mut self) -> (ReadRequestResult, Option<ParsedRequest>) {
        self.state = WorkerState::ReadingHeaders;
        let deadline = self.header_deadline();

        let writer = self.writer.as_mut().expect("stream detached");
        let mut parser = RequestParser::new(
            &mut self.reader,
            writer,
            &self.shared.config,
            &self.shared.hooks,
            self.remote_ip.clone(),
            self.shared.config.ssl_offloaded,
        );
        let (result, parsed) = parser.read_request(false, deadline);
        self.shared.stats.increment(result);
        (result, parsed)
    }

    /// Handles one already-parsed request and closes.
    pub(crate) fn run_single(mut self, parsed: ParsedRequest) {
        let _ = self.handle_request(parsed);
        self.state = WorkerState::Closing;
    }

    /// The connection loop: serve `first` if present, then keep reading
    /// requests while keep-alive holds.
    pub(crate) fn run(mut self, first: Option<ParsedRequest>) {
        if let Some(parsed) = first {
            if !self.handle_request(parsed) {
                self.state = WorkerState::Closing;
                return;
            }
        }

        let wait_window = if self.shared.config.keep_alive_timeout.is_zero() {
            self.shared.config.receive_timeout
        } else {
            self.shared.config.keep_alive_timeout
        };
        let spin_guard_window = self.shared.config.spin_guard_window;
        let spin_guard_sleep = self.shared.config.spin_guard_sleep;

        'connection: loop {
            if self.terminated() {
                break;
            }

            self.state = WorkerState::KeepAliveWait;
            self.set_read_timeout(PEEK_INTERVAL);
            let deadline = Instant::now() + wait_window;

            loop {
                if self.terminated() {
                    break 'connection;
                }

                let peek_started = Instant::now();
                match self.reader.fill_buf() {
                    Ok(buf) => {
                        if buf.is_empty() {
                            // peer closed between requests
                            break 'connection;
                        }
                    }
                    Err(err)
                        if err.kind() == IoErrorKind::WouldBlock
                            || err.kind() == IoErrorKind::TimedOut =>
                    {
                        if Instant::now() >= deadline {
                            self.shared.stats.increment(ReadRequestResult::Timeout);
                            log::debug!("connection [{}] keep-alive timeout", self.connection_id);
                            break 'connection;
                        }
                        // spurious wakeup guard for peeks returning early
                        if peek_started.elapsed() < spin_guard_window {
                            std::thread::sleep(spin_guard_sleep);
                        }
                        continue;
                    }
                    Err(err) => {
                        log::debug!("connection [{}] peek fail: {err:?}", self.connection_id);
                        break 'connection;
                    }
                }

                // data is pending, read the whole request
                self.set_read_timeout(self.shared.config.receive_timeout);
                self.state = WorkerState::ReadingHeaders;
                let hdr_deadline = self.header_deadline();

                let writer = self.writer.as_mut().expect("stream detached");
                let mut parser = RequestParser::new(
                    &mut self.reader,
                    writer,
                    &self.shared.config,
                    &self.shared.hooks,
                    self.remote_ip.clone(),
                    self.shared.config.ssl_offloaded,
                );
                let (result, parsed) = parser.read_request(true, hdr_deadline);
                self.shared.stats.increment(result);

                match (result, parsed) {
                    (
                        ReadRequestResult::HeaderReceived | ReadRequestResult::BodyReceived,
                        Some(parsed),
                    ) => {
                        if !self.handle_request(parsed) {
                            break 'connection;
                        }
                        continue 'connection;
                    }
                    (ReadRequestResult::Owned, Some(parsed)) => {
                        let hook = self.shared.hooks.upgrade.clone();
                        if let Some((ctx, stream)) = self.detach(parsed) {
                            if let Some(hook) = hook {
                                hook(ctx, stream);
                            }
                        }
                        return;
                    }
                    _ => break 'connection,
                }
            }
        }

        self.state = WorkerState::Closing;
    }

    /// Completes one request: ids, deferred body, hooks, response.
    /// Returns true when the connection may serve another request.
    fn handle_request(&mut self, mut parsed: ParsedRequest) -> bool {
        self.prepare_context(&mut parsed);

        if !parsed.body_read {
            self.state = WorkerState::AwaitingBody;
            let writer = self.writer.as_mut().expect("stream detached");
            let mut parser = RequestParser::new(
                &mut self.reader,
                writer,
                &self.shared.config,
                &self.shared.hooks,
                self.remote_ip.clone(),
                self.shared.config.ssl_offloaded,
            );
            match parser.read_body(&mut parsed) {
                Ok(()) => self.shared.stats.increment(ReadRequestResult::BodyReceived),
                Err(result) => {
                    self.shared.stats.increment(result);
                    return false;
                }
            }
        }

        self.state = WorkerState::Handling;
        let outcome = pipeline::run_hooks(&self.shared.hooks, &mut parsed.ctx);

        self.state = WorkerState::Writing;
        let writer = self.writer.as_mut().expect("stream detached");
        let mut response_writer = ResponseWriter::new(
            writer,
            &self.shared.config,
            &self.shared.compress,
            self.shared.hooks.send_file.as_ref(),
        );
        match pipeline::write_and_notify(
            &self.shared.hooks,
            &mut parsed.ctx,
            &mut response_writer,
            outcome,
            parsed.keep_alive,
            &parsed.accept_encoding,
        ) {
            Ok((status, written)) => {
                self.bytes_in += parsed.bytes_in;
                self.bytes_out += written;
                log::info!(
                    "response [{}] {} {} ({status})",
                    self.remote_ip,
                    parsed.ctx.method,
                    parsed.ctx.url
                );
                parsed.keep_alive
            }
            Err(err) => {
                log::debug!("response write fail [{}]: {err:?}", self.connection_id);
                self.bytes_in += parsed.bytes_in;
                false
            }
        }
    }

    /// Releases ownership of the socket.
    ///
    /// The worker unregisters the connection before returning, so the socket
    /// is invisible to shutdown's drain and is never closed here. `None` only
    /// when the final flush failed and the stream is unusable.
    pub(crate) fn detach(
        mut self,
        mut parsed: ParsedRequest,
    ) -> Option<(RequestContext, ConnectionStream)> {
        self.state = WorkerState::Owned;
        self.prepare_context(&mut parsed);
        self.bytes_in += parsed.bytes_in;

        let writer = self.writer.take().expect("stream detached");
        let stream = match writer.into_inner() {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("detach flush fail [{}]: {err:?}", self.connection_id);
                let _ = err;
                return None;
            }
        };
        let _ = stream.set_read_timeout(None);

        log::debug!("connection [{}] handed off", self.connection_id);
        Some((parsed.ctx, stream))
    }

    fn prepare_context(&mut self, parsed: &mut ParsedRequest) {
        if let Some(id) = parsed.forwarded_conn_id {
            if id != 0 {
                self.connection_id = id;
            }
        }
        parsed.ctx.connection_id = self.connection_id;
        parsed.ctx.prepare(&self.shared.request_ids);
    }

    fn header_deadline(&self) -> Option<Instant> {
        let delay = self.shared.config.header_retrieve_abort_delay;
        if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        }
    }

    fn terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    fn set_read_timeout(&self, dur: Duration) {
        if let Err(err) = self.reader.get_ref().set_read_timeout(Some(dur)) {
            log::debug!("set_read_timeout fail: {err:?}");
            let _ = err;
        }
    }
}

impl Drop for ConnectionWorker {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
            let _ = writer.get_ref().shutdown(std::net::Shutdown::Both);
        }

        self.shared
            .unregister_worker(self.key, self.bytes_in, self.bytes_out);
        self.shared.stats.on_disconnect();
        log::debug!(
            "connection [{}] done ({:?})",
            self.connection_id,
            self.state
        );
    }
}
