//! Fixed worker pool for connection intake
//!
//! The pool processes the *first* request of each newly-accepted connection
//! with the body left unread. Short-lived connections are served in place;
//! anything long-lived (keep-alive, or a declared body above the promotion
//! threshold) is promoted to a dedicated [`ConnectionWorker`] thread so a
//! single slow client cannot occupy a pool slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use crate::connection::{AcceptedConnection, ConnectionWorker};
use crate::log;
use crate::parser::ReadRequestResult;
use crate::server::ServerShared;
use crate::server_config::PROMOTE_BODY_SIZE;

/// Bounds for the configured pool worker count
const WORKER_COUNT_MIN: usize = 1;
const WORKER_COUNT_MAX: usize = 256;

#[derive(Clone)]
pub(crate) struct WorkerPool {
    sharing: Arc<Sharing>,
}

struct Sharing {
    /// queued connections waiting for a pool worker
    queue: Mutex<VecDeque<AcceptedConnection>>,

    /// notified whenever a connection is queued
    task_ready: Condvar,

    /// notified whenever a connection is popped
    space_ready: Condvar,

    /// flag to decide to run or exit
    run: AtomicBool,

    server: Arc<ServerShared>,
}

impl WorkerPool {
    /// Starts the configured number of pool workers.
    pub(crate) fn new(server: Arc<ServerShared>) -> Self {
        let worker_count = server
            .config
            .worker_pool_size
            .clamp(WORKER_COUNT_MIN, WORKER_COUNT_MAX);

        let pool = Self {
            sharing: Arc::new(Sharing {
                queue: Mutex::new(VecDeque::new()),
                task_ready: Condvar::new(),
                space_ready: Condvar::new(),
                run: AtomicBool::new(true),
                server,
            }),
        };

        for _ in 0..worker_count {
            let sharing = Arc::clone(&pool.sharing);
            let _ = thread::spawn(move || Self::worker_loop(&sharing));
        }
        log::info!("started {worker_count} pool worker(s)");

        pool
    }

    /// Enqueues an accepted connection.
    ///
    /// When the queue is at capacity and `block_on_contention` is set this
    /// blocks up to the contention-abort delay for a slot; returns false when
    /// the connection should be dropped instead.
    pub(crate) fn push(&self, conn: AcceptedConnection, block_on_contention: bool) -> bool {
        let cap = self.sharing.server.config.queue_length;
        let mut queue = match self.sharing.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return false,
        };

        if queue.len() >= cap {
            if !block_on_contention {
                return false;
            }
            let deadline = Instant::now() + self.sharing.server.config.contention_abort_delay;
            while queue.len() >= cap {
                if !self.sharing.run.load(Ordering::Acquire) {
                    return false;
                }
                let now = Instant::now();
                if now >= deadline {
                    log::warn!("connection queue full, dropping connection");
                    return false;
                }
                queue = match self.sharing.space_ready.wait_timeout(queue, deadline - now) {
                    Ok((queue, _)) => queue,
                    Err(_) => return false,
                };
            }
        }

        queue.push_back(conn);
        self.sharing.task_ready.notify_one();
        true
    }

    /// Stops the workers and drops whatever is still queued.
    pub(crate) fn shutdown(&self) {
        self.sharing.run.store(false, Ordering::Release);
        self.sharing.task_ready.notify_all();
        self.sharing.space_ready.notify_all();

        if let Ok(mut queue) = self.sharing.queue.lock() {
            while let Some(conn) = queue.pop_front() {
                self.sharing.server.stats.on_disconnect();
                drop(conn);
            }
        }
    }

    fn worker_loop(sharing: &Arc<Sharing>) {
        loop {
            let conn = {
                let mut queue = match sharing.queue.lock() {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
                loop {
                    if !sharing.run.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(conn) = queue.pop_front() {
                        sharing.space_ready.notify_one();
                        break conn;
                    }
                    queue = match sharing.task_ready.wait(queue) {
                        Ok(queue) => queue,
                        Err(_) => return,
                    };
                }
            };

            Self::process(&sharing.server, conn);
        }
    }

    /// First-request routing for one pooled connection.
    fn process(server: &Arc<ServerShared>, conn: AcceptedConnection) {
        let mut worker = match ConnectionWorker::new(Arc::clone(server), conn) {
            Ok(worker) => worker,
            Err(err) => {
                log::debug!("connection setup fail: {err:?}");
                server.stats.on_disconnect();
                return;
            }
        };

        let (result, parsed) = worker.read_first();
        match (result, parsed) {
            (ReadRequestResult::HeaderReceived, Some(parsed)) => {
                if parsed.keep_alive || parsed.content_length > PROMOTE_BODY_SIZE {
                    // long-lived: move to a dedicated thread, free the slot
                    if let Err(err) = thread::Builder::new()
                        .spawn(move || worker.run(Some(parsed)))
                    {
                        log::error!("promote fail: {err:?}");
                        let _ = err;
                    }
                } else {
                    worker.run_single(parsed);
                }
            }
            (ReadRequestResult::Owned, Some(parsed)) => {
                let hook = server.hooks.upgrade.clone();
                if let Some((ctx, stream)) = worker.detach(parsed) {
                    if let Some(hook) = hook {
                        hook(ctx, stream);
                    }
                }
            }
            _ => drop(worker),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}
