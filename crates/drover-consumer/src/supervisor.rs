//! Top-level lifecycle: start one poller pool per listener, propagate
//! shutdown, and block until everything drains.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use drover_queue::{QueueClient, QueueError};

use crate::dispatcher::Dispatcher;
use crate::poller::{Poller, PollerExit};
use crate::registry::Registry;
use crate::shutdown::{ShutdownPhase, ShutdownToken};
use crate::stats::ListenerStats;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long in-flight work may run after drain is requested.
    pub grace_period: Duration,
    /// Treat an unreachable queue at startup as a fatal error instead of a
    /// warning.
    pub strict_startup: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
            strict_startup: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("registry has no listeners")]
    EmptyRegistry,

    #[error("queue {queue_url} unreachable at startup: {source}")]
    StartupProbe {
        queue_url: String,
        source: QueueError,
    },
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// All pollers finished within the grace period.
    pub drained_cleanly: bool,
    /// Messages still in flight when the grace period expired. Their
    /// heartbeats were stopped, so they will redeliver.
    pub abandoned_in_flight: usize,
    /// Pollers that stopped early on unrecoverable errors.
    pub failed_pollers: usize,
}

impl RunOutcome {
    /// Process exit code: 0 for a clean drain, 2 when work was abandoned.
    pub fn exit_code(&self) -> i32 {
        if self.abandoned_in_flight > 0 {
            2
        } else {
            0
        }
    }
}

/// Owns the shutdown token and the poller tasks for every registered
/// listener.
pub struct Supervisor {
    client: Arc<dyn QueueClient>,
    registry: Registry,
    options: SupervisorOptions,
    shutdown: ShutdownToken,
}

impl Supervisor {
    pub fn new(client: Arc<dyn QueueClient>, registry: Registry) -> Self {
        Self::with_options(client, registry, SupervisorOptions::default())
    }

    pub fn with_options(
        client: Arc<dyn QueueClient>,
        registry: Registry,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            client,
            registry,
            options,
            shutdown: ShutdownToken::new(),
        }
    }

    /// The token that requests shutdown; clone it into the signal handler.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Run every registered listener until shutdown, then drain.
    ///
    /// Returns once all pollers have stopped or the grace period expired.
    pub async fn run_all(mut self) -> Result<RunOutcome, SupervisorError> {
        if self.registry.is_empty() {
            return Err(SupervisorError::EmptyRegistry);
        }

        let listeners = std::mem::take(&mut self.registry).into_listeners();
        for listener in &listeners {
            self.probe_queue(&listener.queue_url).await?;
        }

        let mut handles = Vec::new();
        let mut listener_stats = Vec::new();
        for listener in listeners {
            let stats = Arc::new(ListenerStats::default());
            listener_stats.push((listener.queue_url.clone(), stats.clone()));

            let mode = listener.handler.mode();
            let workers = Arc::new(Semaphore::new(listener.config.worker_threads));
            let dispatcher = Arc::new(Dispatcher::new(
                self.client.clone(),
                listener.queue_url.clone(),
                listener.config.clone(),
                listener.handler,
                workers,
                stats.clone(),
                self.shutdown.clone(),
            ));

            info!(
                queue_url = %listener.queue_url,
                mode = mode,
                workers = listener.config.worker_threads,
                batch_size = listener.config.batch_size,
                visibility_seconds = listener.config.visibility_timeout_seconds,
                "starting listener"
            );

            for id in 0..listener.config.worker_threads {
                let poller = Poller {
                    client: self.client.clone(),
                    queue_url: listener.queue_url.clone(),
                    config: listener.config.clone(),
                    dispatcher: dispatcher.clone(),
                    shutdown: self.shutdown.clone(),
                    stats: stats.clone(),
                    id,
                };
                handles.push(tokio::spawn(poller.run()));
            }
        }

        info!(
            listeners = listener_stats.len(),
            pollers = handles.len(),
            "consumer runtime started"
        );

        let mut pollers = join_all(handles);

        // Either a drain is requested, or every poller dies on its own
        // (all listeners hit unrecoverable errors).
        let early_results = tokio::select! {
            results = &mut pollers => Some(results),
            _ = self.shutdown.wait_for(ShutdownPhase::Drain) => None,
        };

        let (drained_cleanly, results) = match early_results {
            Some(results) => {
                warn!("all pollers stopped without a shutdown request");
                self.shutdown.drain();
                (true, Some(results))
            }
            None => {
                info!(
                    grace_seconds = self.options.grace_period.as_secs(),
                    "drain requested, waiting for in-flight work"
                );
                match tokio::time::timeout(self.options.grace_period, &mut pollers).await {
                    Ok(results) => (true, Some(results)),
                    Err(_) => {
                        warn!(
                            grace_seconds = self.options.grace_period.as_secs(),
                            "grace period expired, abandoning in-flight work"
                        );
                        // Heartbeats observe this and stop extending, so the
                        // abandoned messages redeliver after expiry.
                        self.shutdown.abandon();
                        (false, None)
                    }
                }
            }
        };

        let abandoned_in_flight = if drained_cleanly {
            0
        } else {
            listener_stats
                .iter()
                .map(|(_, stats)| stats.in_flight())
                .sum()
        };

        let failed_pollers = results
            .map(|results| {
                results
                    .iter()
                    .filter(|result| matches!(result, Ok(PollerExit::Failed)))
                    .count()
            })
            .unwrap_or(0);

        for (queue_url, stats) in &listener_stats {
            let snapshot = stats.snapshot();
            info!(
                queue_url = %queue_url,
                received = snapshot.received,
                handled_ok = snapshot.handled_ok,
                handled_failed = snapshot.handled_failed,
                deleted = snapshot.deleted,
                lease_lost = snapshot.lease_lost,
                capped = snapshot.capped,
                in_flight = snapshot.in_flight,
                "listener summary"
            );
        }

        info!(
            drained_cleanly = drained_cleanly,
            abandoned_in_flight = abandoned_in_flight,
            failed_pollers = failed_pollers,
            "consumer runtime stopped"
        );

        Ok(RunOutcome {
            drained_cleanly,
            abandoned_in_flight,
            failed_pollers,
        })
    }

    /// Log the queue's approximate depth at startup; with strict startup an
    /// unreachable queue is fatal.
    async fn probe_queue(&self, queue_url: &str) -> Result<(), SupervisorError> {
        match self.client.get_queue_attributes(queue_url).await {
            Ok(attributes) => {
                let depth = attributes
                    .get("ApproximateNumberOfMessages")
                    .map(String::as_str)
                    .unwrap_or("unknown");
                let not_visible = attributes
                    .get("ApproximateNumberOfMessagesNotVisible")
                    .map(String::as_str)
                    .unwrap_or("unknown");
                info!(
                    queue_url = %queue_url,
                    approximate_depth = depth,
                    approximate_in_flight = not_visible,
                    "queue reachable"
                );
                Ok(())
            }
            Err(source) if self.options.strict_startup => Err(SupervisorError::StartupProbe {
                queue_url: queue_url.to_string(),
                source,
            }),
            Err(err) => {
                warn!(
                    queue_url = %queue_url,
                    error = %err,
                    "queue attributes probe failed at startup"
                );
                Ok(())
            }
        }
    }
}
