//! Read-only operational counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::parser::ReadRequestResult;

/// Counters kept by a running [`HttpServer`](crate::HttpServer).
///
/// All increments are atomic; a [`snapshot`](ServerStats::snapshot) is not a
/// consistent cut across counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,

    error: AtomicU64,
    exception: AtomicU64,
    oversized_payload: AtomicU64,
    rejected: AtomicU64,
    timeout: AtomicU64,
    header_received: AtomicU64,
    body_received: AtomicU64,
    owned: AtomicU64,
}

impl ServerStats {
    /// Number of currently open client connections
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Number of accepted client connections since start
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Acquire)
    }

    pub(crate) fn on_connect(&self) {
        let _ = self.total_connections.fetch_add(1, Ordering::Release);
        let _ = self.active_connections.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn on_disconnect(&self) {
        let _ = self.active_connections.fetch_sub(1, Ordering::Release);
    }

    pub(crate) fn increment(&self, result: ReadRequestResult) {
        let counter = match result {
            ReadRequestResult::Error => &self.error,
            ReadRequestResult::Exception => &self.exception,
            ReadRequestResult::OversizedPayload => &self.oversized_payload,
            ReadRequestResult::Rejected => &self.rejected,
            ReadRequestResult::Timeout => &self.timeout,
            ReadRequestResult::HeaderReceived => &self.header_received,
            ReadRequestResult::BodyReceived => &self.body_received,
            ReadRequestResult::Owned => &self.owned,
        };
        let _ = counter.fetch_add(1, Ordering::Release);
    }

    /// Current value of the counter for one [`ReadRequestResult`] outcome
    #[must_use]
    pub fn outcome(&self, result: ReadRequestResult) -> u64 {
        let counter = match result {
            ReadRequestResult::Error => &self.error,
            ReadRequestResult::Exception => &self.exception,
            ReadRequestResult::OversizedPayload => &self.oversized_payload,
            ReadRequestResult::Rejected => &self.rejected,
            ReadRequestResult::Timeout => &self.timeout,
            ReadRequestResult::HeaderReceived => &self.header_received,
            ReadRequestResult::BodyReceived => &self.body_received,
            ReadRequestResult::Owned => &self.owned,
        };
        counter.load(Ordering::Acquire)
    }

    /// Copies all counters into a plain value
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections(),
            total_connections: self.total_connections(),
            error: self.outcome(ReadRequestResult::Error),
            exception: self.outcome(ReadRequestResult::Exception),
            oversized_payload: self.outcome(ReadRequestResult::OversizedPayload),
            rejected: self.outcome(ReadRequestResult::Rejected),
            timeout: self.outcome(ReadRequestResult::Timeout),
            header_received: self.outcome(ReadRequestResult::HeaderReceived),
            body_received: self.outcome(ReadRequestResult::BodyReceived),
            owned: self.outcome(ReadRequestResult::Owned),
        }
    }
}

/// Point-in-time copy of [`ServerStats`]
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub error: u64,
    pub exception: u64,
    pub oversized_payload: u64,
    pub rejected: u64,
    pub timeout: u64,
    pub header_received: u64,
    pub body_received: u64,
    pub owned: u64,
}

#[cfg(test)]
mod tests {
    use super::{ReadRequestResult, ServerStats};

    #[test]
    fn connection_counting() {
        let stats = ServerStats::default();
        stats.on_connect();
        stats.on_connect();
        assert_eq!(stats.active_connections(), 2);
        assert_eq!(stats.total_connections(), 2);

        stats.on_disconnect();
        stats.on_disconnect();
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.total_connections(), 2);
    }

    #[test]
    fn outcome_counters() {
        let stats = ServerStats::default();
        stats.increment(ReadRequestResult::Rejected);
        stats.increment(ReadRequestResult::Rejected);
        stats.increment(ReadRequestResult::BodyReceived);

        let snap = stats.snapshot();
        assert_eq!(snap.rejected, 2);
        assert_eq!(snap.body_received, 1);
        assert_eq!(snap.error, 0);
    }
}
