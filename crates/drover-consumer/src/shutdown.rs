//! Process-wide shutdown coordination.
//!
//! A single token is shared by the supervisor, every poller, and every
//! heartbeat. Shutdown happens in two phases: `Drain` stops new receives
//! while in-flight work completes; `Abandon` fires when the grace period
//! expires and tells heartbeats to stop extending leases so abandoned
//! messages redeliver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Stop initiating receives; in-flight batches run to completion.
    Drain,
    /// Grace period expired; stop heartbeats, remaining work is abandoned.
    Abandon,
}

/// Cloneable shutdown token observed by all runtime tasks.
///
/// The phase flags are atomics so loop-head checks never block; the
/// broadcast channel wakes tasks that are parked in a long poll or a timer.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

struct Inner {
    draining: AtomicBool,
    abandoned: AtomicBool,
    tx: broadcast::Sender<ShutdownPhase>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(Inner {
                draining: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Request drain. Idempotent.
    pub fn drain(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            let _ = self.inner.tx.send(ShutdownPhase::Drain);
        }
    }

    /// Declare in-flight work abandoned. Implies drain. Idempotent.
    pub fn abandon(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        if !self.inner.abandoned.swap(true, Ordering::SeqCst) {
            let _ = self.inner.tx.send(ShutdownPhase::Abandon);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::SeqCst)
    }

    /// Completes once the given phase has been entered. Returns immediately
    /// if it already has.
    pub async fn wait_for(&self, phase: ShutdownPhase) {
        let mut rx = self.inner.tx.subscribe();
        loop {
            if self.reached(phase) {
                return;
            }
            match rx.recv().await {
                Ok(received) if received == phase || self.reached(phase) => return,
                // Lagged receivers re-check the flags at the loop head.
                _ => {}
            }
        }
    }

    fn reached(&self, phase: ShutdownPhase) -> bool {
        match phase {
            ShutdownPhase::Drain => self.is_draining(),
            ShutdownPhase::Abandon => self.is_abandoned(),
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
