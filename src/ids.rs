//! Connection and request identifier sequences
//!
//! Connection ids are 63-bit and strictly positive; request ids are 31-bit
//! and scoped to one server instance. Both wrap 2048 short of their maximum
//! so an id never goes negative in signed arithmetic on the embedder side.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lazy_static::lazy_static;

/// Largest handed-out connection id before the sequence wraps back to 1
pub const CONNECTION_ID_MAX: u64 = i64::MAX as u64 - 2048;
/// Largest handed-out request id before the sequence wraps back to 1
pub const REQUEST_ID_MAX: u32 = i32::MAX as u32 - 2048;

lazy_static! {
    /// Process-wide fallback used by contexts prepared without a server,
    /// reachable only through [`RequestIds::global`]
    static ref GLOBAL_REQUEST_IDS: RequestIds = RequestIds::new();
}

/// Monotonic 63-bit sequence for connection identifiers
#[derive(Debug, Default)]
pub(crate) struct ConnectionIds {
    counter: AtomicU64,
}

impl ConnectionIds {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the next id, always in `1..=CONNECTION_ID_MAX`
    pub(crate) fn next(&self) -> u64 {
        let mut cur = self.counter.load(Ordering::Acquire);
        loop {
            let new = if cur >= CONNECTION_ID_MAX { 1 } else { cur + 1 };
            match self
                .counter
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new,
                Err(seen) => cur = seen,
            }
        }
    }
}

/// Monotonic 31-bit sequence for request identifiers
#[derive(Debug, Default)]
pub struct RequestIds {
    counter: AtomicU32,
}

impl RequestIds {
    /// Creates a fresh sequence starting at 1
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide fallback sequence, used when no server instance is
    /// associated with a request
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_REQUEST_IDS
    }

    /// Returns the next id, always in `1..=REQUEST_ID_MAX`
    #[must_use]
    pub fn next(&self) -> u32 {
        let mut cur = self.counter.load(Ordering::Acquire);
        loop {
            let new = if cur >= REQUEST_ID_MAX { 1 } else { cur + 1 };
            match self
                .counter
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new,
                Err(seen) => cur = seen,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{ConnectionIds, RequestIds, CONNECTION_ID_MAX, REQUEST_ID_MAX};

    #[test]
    fn connection_ids_positive_and_monotonic() {
        let ids = ConnectionIds::new();
        let mut prev = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert!(id > 0);
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn connection_ids_wrap() {
        let ids = ConnectionIds::new();
        ids.counter.store(CONNECTION_ID_MAX - 1, Ordering::Release);
        assert_eq!(ids.next(), CONNECTION_ID_MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn request_ids_wrap() {
        let ids = RequestIds::new();
        ids.counter.store(REQUEST_ID_MAX, Ordering::Release);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn request_ids_concurrent_distinct() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let ids = Arc::new(RequestIds::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| ids.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for jh in handles {
            for id in jh.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn global_is_shared() {
        let a = RequestIds::global().next();
        let b = RequestIds::global().next();
        assert_ne!(a, b);
    }
}
