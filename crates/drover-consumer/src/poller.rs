//! The per-listener receive loop.
//!
//! Each listener runs `worker_threads` independent pollers against the same
//! queue. A poller long-polls, hands every non-empty batch to the
//! dispatcher, and waits for settlement before polling again, so the number
//! of in-flight batches per listener never exceeds the poller count.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use drover_queue::{QueueClient, ReceiveOptions};

use crate::config::ListenerConfig;
use crate::dispatcher::Dispatcher;
use crate::retry::Backoff;
use crate::shutdown::{ShutdownPhase, ShutdownToken};
use crate::stats::ListenerStats;

const ERROR_BACKOFF_BASE: Duration = Duration::from_secs(1);
const ERROR_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How a poller ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerExit {
    /// Observed the drain signal and stopped cleanly.
    Drained,
    /// Hit an unrecoverable receive error (authorization, missing queue).
    Failed,
}

pub(crate) struct Poller {
    pub client: Arc<dyn QueueClient>,
    pub queue_url: String,
    pub config: ListenerConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: ShutdownToken,
    pub stats: Arc<ListenerStats>,
    pub id: usize,
}

impl Poller {
    pub async fn run(self) -> PollerExit {
        info!(queue_url = %self.queue_url, poller = self.id, "poller started");
        let mut error_backoff = Backoff::new(ERROR_BACKOFF_BASE, ERROR_BACKOFF_CAP);

        let exit = loop {
            if self.shutdown.is_draining() {
                break PollerExit::Drained;
            }

            let opts = ReceiveOptions {
                max_messages: self.config.batch_size as i32,
                wait_time_seconds: self.config.wait_time_seconds as i32,
                visibility_timeout_seconds: self.config.visibility_timeout_seconds as i32,
            };

            // The long poll is raced against drain so shutdown does not wait
            // out a full poll window.
            let received = tokio::select! {
                _ = self.shutdown.wait_for(ShutdownPhase::Drain) => break PollerExit::Drained,
                result = self.client.receive(&self.queue_url, opts) => result,
            };

            match received {
                Ok(batch) if batch.is_empty() => {
                    // Randomized sleep de-synchronizes sibling pollers.
                    let idle = self
                        .config
                        .idle_sleep_max
                        .mul_f64(rand::rng().random_range(0.0..=1.0));
                    if self.sleep_or_drain(idle).await {
                        break PollerExit::Drained;
                    }
                }
                Ok(batch) => {
                    self.stats
                        .received
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(
                        queue_url = %self.queue_url,
                        poller = self.id,
                        count = batch.len(),
                        "dispatching batch"
                    );
                    self.dispatcher.dispatch(batch).await;
                    error_backoff.reset();
                }
                Err(err) if err.is_retryable() => {
                    let delay = error_backoff.jittered_delay();
                    warn!(
                        queue_url = %self.queue_url,
                        poller = self.id,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "receive failed, backing off"
                    );
                    if self.sleep_or_drain(delay).await {
                        break PollerExit::Drained;
                    }
                }
                Err(err) => {
                    error!(
                        queue_url = %self.queue_url,
                        poller = self.id,
                        error = %err,
                        "unrecoverable receive error, stopping this poller"
                    );
                    break PollerExit::Failed;
                }
            }
        };

        info!(queue_url = %self.queue_url, poller = self.id, exit = ?exit, "poller stopped");
        exit
    }

    /// Sleep, returning early (and `true`) if drain is requested meanwhile.
    async fn sleep_or_drain(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.wait_for(ShutdownPhase::Drain) => true,
        }
    }
}
