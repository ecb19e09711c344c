//! Visibility-timeout leasing.
//!
//! While a handler processes a message, a heartbeat task keeps extending
//! the message's visibility timeout so the queue service does not redeliver
//! it to another worker. Extension stops at the configured cap; a capped or
//! lost lease makes the message ineligible for deletion even if the handler
//! later reports success, because redelivery may already have happened.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use drover_queue::{QueueClient, QueueError, MAX_BATCH_ENTRIES};

use crate::config::ListenerConfig;
use crate::retry::Backoff;
use crate::shutdown::{ShutdownPhase, ShutdownToken};
use crate::stats::ListenerStats;

const EXTENSION_RETRY_BASE: Duration = Duration::from_millis(500);
const EXTENSION_RETRY_CAP: Duration = Duration::from_secs(5);

/// Lease lifecycle per in-flight message. Only `SettledOk` permits delete;
/// `LeaseLost` and `Capped` are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseState {
    Leased,
    SettledOk,
    SettledFail,
    LeaseLost,
    Capped,
}

#[derive(Debug)]
struct Lease {
    received_at: Instant,
    expires_at: Instant,
    state: LeaseState,
}

/// Shared map of receipt handle to lease, owned by one dispatch and
/// observed by its heartbeat task.
pub(crate) struct LeaseTable {
    queue_url: String,
    visibility: Duration,
    max_extend: Duration,
    safety_margin: Duration,
    leases: DashMap<String, Lease>,
}

impl LeaseTable {
    pub fn new(queue_url: &str, config: &ListenerConfig) -> Self {
        Self {
            queue_url: queue_url.to_string(),
            visibility: config.visibility(),
            max_extend: config.max_extend(),
            safety_margin: config.safety_margin(),
            leases: DashMap::new(),
        }
    }

    /// Track a freshly received message. The initial visibility window was
    /// set by the receive call itself.
    pub fn register(&self, handle: &str) {
        let now = Instant::now();
        self.leases.insert(
            handle.to_string(),
            Lease {
                received_at: now,
                expires_at: now + self.visibility,
                state: LeaseState::Leased,
            },
        );
    }

    pub fn settle_ok(&self, handle: &str) {
        self.settle(handle, LeaseState::SettledOk);
    }

    pub fn settle_failed(&self, handle: &str) {
        self.settle(handle, LeaseState::SettledFail);
    }

    fn settle(&self, handle: &str, settled: LeaseState) {
        if let Some(mut lease) = self.leases.get_mut(handle) {
            // A lost or capped lease stays that way; the settlement outcome
            // must not overwrite it.
            if lease.state == LeaseState::Leased {
                lease.state = settled;
            }
        }
    }

    /// Whether the message may be deleted: handler success with an intact
    /// lease.
    pub fn deletable(&self, handle: &str) -> bool {
        self.leases
            .get(handle)
            .map(|lease| lease.state == LeaseState::SettledOk)
            .unwrap_or(false)
    }

    pub fn state(&self, handle: &str) -> Option<LeaseState> {
        self.leases.get(handle).map(|lease| lease.state)
    }

    fn mark_lost(&self, handle: &str) -> bool {
        if let Some(mut lease) = self.leases.get_mut(handle) {
            if lease.state == LeaseState::Leased {
                lease.state = LeaseState::LeaseLost;
                return true;
            }
        }
        false
    }

    fn record_extension(&self, handle: &str, now: Instant, granted: Duration) {
        if let Some(mut lease) = self.leases.get_mut(handle) {
            if lease.state == LeaseState::Leased {
                lease.expires_at = now + granted;
            }
        }
    }

    /// The next instant any live lease needs an extension, or `None` when
    /// nothing is leased anymore.
    fn next_deadline(&self) -> Option<Instant> {
        self.leases
            .iter()
            .filter(|entry| entry.state == LeaseState::Leased)
            .map(|entry| entry.expires_at - self.safety_margin)
            .min()
    }

    /// Collect leases due for extension, transitioning those whose cap has
    /// been reached. Each due entry carries the visibility to grant, clamped
    /// so the new expiry never outlives the cap.
    fn due_for_extension(&self, now: Instant) -> DueExtensions {
        let mut due = DueExtensions::default();
        for mut entry in self.leases.iter_mut() {
            if entry.state != LeaseState::Leased {
                continue;
            }
            if now < entry.expires_at - self.safety_margin {
                continue;
            }
            let cap_at = entry.received_at + self.max_extend;
            let remaining = cap_at.saturating_duration_since(now);
            if remaining <= self.safety_margin {
                entry.state = LeaseState::Capped;
                due.capped.push(entry.key().clone());
                continue;
            }
            let granted = self.visibility.min(remaining);
            due.extend.push((entry.key().clone(), granted));
        }
        due
    }

    /// Drop leases that will expire before a retry at `next_attempt` could
    /// land. Returns the abandoned handles.
    fn expire_hopeless(&self, next_attempt: Instant) -> Vec<String> {
        let mut lost = Vec::new();
        for mut entry in self.leases.iter_mut() {
            if entry.state == LeaseState::Leased && entry.expires_at <= next_attempt {
                entry.state = LeaseState::LeaseLost;
                lost.push(entry.key().clone());
            }
        }
        lost
    }
}

#[derive(Debug, Default)]
struct DueExtensions {
    extend: Vec<(String, Duration)>,
    capped: Vec<String>,
}

/// Running heartbeat task for one batch (batch mode) or one message
/// (per-message mode).
pub(crate) struct HeartbeatHandle {
    kill: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop extending and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.kill.send(());
        let _ = self.task.await;
    }
}

/// Spawn the extension loop for the leases in `table`. The task ends when
/// every lease has settled, when stopped, or when shutdown abandons
/// in-flight work.
pub(crate) fn spawn_heartbeat(
    client: Arc<dyn QueueClient>,
    table: Arc<LeaseTable>,
    stats: Arc<ListenerStats>,
    shutdown: ShutdownToken,
) -> HeartbeatHandle {
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = run_heartbeat(client, table, stats) => {}
            _ = kill_rx => {}
            _ = shutdown.wait_for(ShutdownPhase::Abandon) => {
                debug!("heartbeat stopping: in-flight work abandoned");
            }
        }
    });
    HeartbeatHandle {
        kill: kill_tx,
        task,
    }
}

async fn run_heartbeat(
    client: Arc<dyn QueueClient>,
    table: Arc<LeaseTable>,
    stats: Arc<ListenerStats>,
) {
    let mut retry = Backoff::new(EXTENSION_RETRY_BASE, EXTENSION_RETRY_CAP);

    loop {
        let Some(deadline) = table.next_deadline() else {
            return;
        };
        tokio::time::sleep_until(deadline).await;

        let now = Instant::now();
        let due = table.due_for_extension(now);

        for handle in &due.capped {
            warn!(
                queue_url = %table.queue_url,
                receipt_handle = %handle,
                max_extend_seconds = table.max_extend.as_secs(),
                "extension cap reached; lease will lapse and the message may redeliver"
            );
        }
        stats.capped.fetch_add(due.capped.len() as u64, Ordering::Relaxed);

        if due.extend.is_empty() {
            continue;
        }

        let mut transient_failure = false;
        for chunk in due.extend.chunks(MAX_BATCH_ENTRIES) {
            let entries: Vec<(String, i32)> = chunk
                .iter()
                .map(|(handle, granted)| (handle.clone(), secs_ceil(*granted)))
                .collect();

            match client.change_visibility_batch(&table.queue_url, &entries).await {
                Ok(outcome) => {
                    for handle in &outcome.changed {
                        let granted = chunk
                            .iter()
                            .find(|(h, _)| h == handle)
                            .map(|(_, granted)| *granted)
                            .unwrap_or(table.visibility);
                        table.record_extension(handle, now, granted);
                    }
                    for (handle, err) in &outcome.failed {
                        match err {
                            QueueError::InvalidHandle(_) | QueueError::NotFound(_) => {
                                warn!(
                                    queue_url = %table.queue_url,
                                    receipt_handle = %handle,
                                    error = %err,
                                    "lease lost during extension"
                                );
                                lose_lease(&table, &stats, handle);
                            }
                            err if err.is_retryable() => transient_failure = true,
                            err => {
                                error!(
                                    queue_url = %table.queue_url,
                                    receipt_handle = %handle,
                                    error = %err,
                                    "unrecoverable extension failure, dropping lease"
                                );
                                lose_lease(&table, &stats, handle);
                            }
                        }
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        queue_url = %table.queue_url,
                        error = %err,
                        "visibility extension call failed, will retry"
                    );
                    transient_failure = true;
                }
                Err(err) => {
                    error!(
                        queue_url = %table.queue_url,
                        error = %err,
                        "visibility extension call failed terminally, dropping leases"
                    );
                    for (handle, _) in chunk {
                        lose_lease(&table, &stats, handle);
                    }
                }
            }
        }

        if transient_failure {
            // Retry with backoff, but never past a lease's expiry: a lease
            // that would expire before the next attempt is already gone.
            let delay = retry.delay();
            let lost = table.expire_hopeless(now + delay);
            if !lost.is_empty() {
                warn!(
                    queue_url = %table.queue_url,
                    count = lost.len(),
                    "leases expired before extension could be retried"
                );
                stats.lease_lost.fetch_add(lost.len() as u64, Ordering::Relaxed);
            }
            tokio::time::sleep(delay).await;
        } else {
            retry.reset();
        }
    }
}

fn lose_lease(table: &LeaseTable, stats: &ListenerStats, handle: &str) {
    if table.mark_lost(handle) {
        stats.lease_lost.fetch_add(1, Ordering::Relaxed);
    }
}

fn secs_ceil(duration: Duration) -> i32 {
    duration.as_secs_f64().ceil() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(visibility: u32, max_extend: u32) -> LeaseTable {
        let config = ListenerConfig {
            visibility_timeout_seconds: visibility,
            max_extend_seconds: max_extend,
            wait_time_seconds: 0,
            ..ListenerConfig::default()
        };
        LeaseTable::new("https://sqs.test/q", &config)
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_only_applies_to_live_leases() {
        let table = table_with(30, 300);
        table.register("rh-1");
        assert_eq!(table.state("rh-1"), Some(LeaseState::Leased));

        table.settle_ok("rh-1");
        assert!(table.deletable("rh-1"));

        // Settling again in the other direction does not flip the state.
        table.settle_failed("rh-1");
        assert!(table.deletable("rh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_refuses_late_success() {
        let table = table_with(30, 300);
        table.register("rh-1");
        assert!(table.mark_lost("rh-1"));

        table.settle_ok("rh-1");
        assert!(!table.deletable("rh-1"));
        assert_eq!(table.state("rh-1"), Some(LeaseState::LeaseLost));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_becomes_due_at_margin() {
        let table = table_with(30, 300);
        table.register("rh-1");

        // Not due right away.
        let due = table.due_for_extension(Instant::now());
        assert!(due.extend.is_empty());

        // Visibility 30s, margin 6s: due at t=24.
        tokio::time::advance(Duration::from_secs(24)).await;
        let due = table.due_for_extension(Instant::now());
        assert_eq!(due.extend.len(), 1);
        assert_eq!(due.extend[0].1, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_is_clamped_to_the_cap() {
        let table = table_with(30, 40);
        table.register("rh-1");

        tokio::time::advance(Duration::from_secs(24)).await;
        let now = Instant::now();
        let due = table.due_for_extension(now);
        // Cap at t=40, so only 16s can be granted.
        assert_eq!(due.extend.len(), 1);
        assert_eq!(due.extend[0].1, Duration::from_secs(16));
        table.record_extension("rh-1", now, due.extend[0].1);

        // Next due moment is expiry(40) - margin(6) = 34; remaining-to-cap
        // is 6s which is within the margin, so the lease is capped.
        tokio::time::advance(Duration::from_secs(10)).await;
        let due = table.due_for_extension(Instant::now());
        assert!(due.extend.is_empty());
        assert_eq!(due.capped, vec!["rh-1".to_string()]);
        assert_eq!(table.state("rh-1"), Some(LeaseState::Capped));
    }

    #[tokio::test(start_paused = true)]
    async fn hopeless_retries_drop_the_lease() {
        let table = table_with(30, 300);
        table.register("rh-1");

        tokio::time::advance(Duration::from_secs(29)).await;
        let lost = table.expire_hopeless(Instant::now() + Duration::from_secs(5));
        assert_eq!(lost, vec!["rh-1".to_string()]);
        assert_eq!(table.state("rh-1"), Some(LeaseState::LeaseLost));
    }

    #[test]
    fn secs_ceil_rounds_up() {
        assert_eq!(secs_ceil(Duration::from_secs(30)), 30);
        assert_eq!(secs_ceil(Duration::from_millis(1500)), 2);
    }
}
