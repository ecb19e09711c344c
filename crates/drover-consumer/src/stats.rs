//! Per-listener lifetime counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one listener, shared by its pollers, dispatchers, and
/// heartbeats.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Messages returned by receive calls.
    pub received: AtomicU64,
    /// Messages the handler reported as succeeded.
    pub handled_ok: AtomicU64,
    /// Messages the handler reported as failed (or that failed by raising).
    pub handled_failed: AtomicU64,
    /// Messages deleted from the queue.
    pub deleted: AtomicU64,
    /// Leases lost to expired receipt handles during extension.
    pub lease_lost: AtomicU64,
    /// Messages whose extension cap was reached while the handler ran.
    pub capped: AtomicU64,
    in_flight: AtomicUsize,
}

impl ListenerStats {
    pub(crate) fn begin_flight(&self, count: usize) {
        self.in_flight.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn end_flight(&self, count: usize) {
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
    }

    /// Messages currently handed to a handler and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            handled_ok: self.handled_ok.load(Ordering::Relaxed),
            handled_failed: self.handled_failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            capped: self.capped.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Point-in-time copy of [`ListenerStats`], used for summary logging.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub received: u64,
    pub handled_ok: u64,
    pub handled_failed: u64,
    pub deleted: u64,
    pub lease_lost: u64,
    pub capped: u64,
    pub in_flight: usize,
}
