//! Handler dispatch and message settlement.
//!
//! Invokes the user handler in the listener's configured mode, then settles
//! every message in the batch: delete on success, leave (or explicitly
//! release) on failure. Deletion is refused for any message whose lease was
//! lost or capped while the handler ran, because redelivery may already
//! have occurred.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use drover_common::Message;
use drover_queue::{QueueClient, QueueError, MAX_BATCH_ENTRIES};

use crate::config::ListenerConfig;
use crate::heartbeat::{spawn_heartbeat, LeaseTable};
use crate::registry::{BatchHandler, Handler, MessageHandler};
use crate::retry::Backoff;
use crate::shutdown::ShutdownToken;
use crate::stats::ListenerStats;

const DELETE_RETRY_ATTEMPTS: u32 = 3;
const DELETE_RETRY_BASE: Duration = Duration::from_millis(200);
const DELETE_RETRY_CAP: Duration = Duration::from_secs(2);

pub(crate) struct Dispatcher {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    config: ListenerConfig,
    handler: Handler,
    /// Listener-wide handler concurrency cap for per-message mode.
    workers: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
    shutdown: ShutdownToken,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue_url: String,
        config: ListenerConfig,
        handler: Handler,
        workers: Arc<Semaphore>,
        stats: Arc<ListenerStats>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            client,
            queue_url,
            config,
            handler,
            workers,
            stats,
            shutdown,
        }
    }

    /// Process one received batch to full settlement. The calling poller
    /// awaits this before polling again.
    pub async fn dispatch(&self, batch: Vec<Message>) {
        let count = batch.len();
        self.stats.begin_flight(count);
        match self.handler.clone() {
            Handler::Batch(handler) => self.dispatch_batch(handler, batch).await,
            Handler::PerMessage(handler) => self.dispatch_per_message(handler, batch).await,
        }
        self.stats.end_flight(count);
    }

    async fn dispatch_batch(&self, handler: Arc<dyn BatchHandler>, batch: Vec<Message>) {
        let table = Arc::new(LeaseTable::new(&self.queue_url, &self.config));
        for message in &batch {
            table.register(message.receipt_handle());
        }
        let heartbeat = spawn_heartbeat(
            self.client.clone(),
            table.clone(),
            self.stats.clone(),
            self.shutdown.clone(),
        );

        let outcome = handler.handle(&batch).await;

        let failed: HashSet<String> = match outcome {
            Ok(result) => {
                let known: HashSet<&str> = batch.iter().map(Message::receipt_handle).collect();
                let mut failed = HashSet::new();
                for handle in result.failed_handles() {
                    if known.contains(handle.as_str()) {
                        failed.insert(handle.clone());
                    } else {
                        warn!(
                            queue_url = %self.queue_url,
                            receipt_handle = %handle,
                            "batch result names a handle outside the delivered batch, ignoring"
                        );
                    }
                }
                failed
            }
            Err(err) => {
                error!(
                    queue_url = %self.queue_url,
                    error = %format!("{err:#}"),
                    batch_size = batch.len(),
                    "batch handler failed, leaving whole batch for redelivery"
                );
                batch
                    .iter()
                    .map(|message| message.receipt_handle().to_string())
                    .collect()
            }
        };

        for message in &batch {
            let handle = message.receipt_handle();
            if failed.contains(handle) {
                table.settle_failed(handle);
            } else {
                table.settle_ok(handle);
            }
        }

        heartbeat.stop().await;

        self.stats
            .handled_ok
            .fetch_add((batch.len() - failed.len()) as u64, Ordering::Relaxed);
        self.stats
            .handled_failed
            .fetch_add(failed.len() as u64, Ordering::Relaxed);

        let mut to_delete = Vec::new();
        for message in &batch {
            let handle = message.receipt_handle();
            if table.deletable(handle) {
                to_delete.push(handle.to_string());
            } else if !failed.contains(handle) {
                warn!(
                    queue_url = %self.queue_url,
                    message_id = %message.message_id(),
                    state = ?table.state(handle),
                    "handler succeeded but the lease lapsed; leaving message to redeliver"
                );
            }
        }

        self.delete_settled(to_delete).await;

        if self.config.release_on_failure && !failed.is_empty() {
            self.release(&failed).await;
        }
    }

    async fn dispatch_per_message(&self, handler: Arc<dyn MessageHandler>, batch: Vec<Message>) {
        let mut tasks = Vec::with_capacity(batch.len());
        for message in batch {
            let handler = handler.clone();
            let client = self.client.clone();
            let workers = self.workers.clone();
            let stats = self.stats.clone();
            let shutdown = self.shutdown.clone();
            let queue_url = self.queue_url.clone();
            let config = self.config.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };

                let table = Arc::new(LeaseTable::new(&queue_url, &config));
                table.register(message.receipt_handle());
                let heartbeat =
                    spawn_heartbeat(client, table.clone(), stats.clone(), shutdown);

                let result = handler.handle(&message).await;

                let handle = message.receipt_handle();
                let wants_delete = match &result {
                    Ok(true) => {
                        table.settle_ok(handle);
                        true
                    }
                    Ok(false) => {
                        debug!(
                            queue_url = %queue_url,
                            message_id = %message.message_id(),
                            "handler declined message, leaving it to redeliver"
                        );
                        table.settle_failed(handle);
                        false
                    }
                    Err(err) => {
                        error!(
                            queue_url = %queue_url,
                            message_id = %message.message_id(),
                            error = %format!("{err:#}"),
                            "message handler failed, leaving message to redeliver"
                        );
                        table.settle_failed(handle);
                        false
                    }
                };

                heartbeat.stop().await;

                if wants_delete {
                    stats.handled_ok.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.handled_failed.fetch_add(1, Ordering::Relaxed);
                }

                if wants_delete && table.deletable(handle) {
                    Some(handle.to_string())
                } else {
                    if wants_delete {
                        warn!(
                            queue_url = %queue_url,
                            message_id = %message.message_id(),
                            state = ?table.state(handle),
                            "handler succeeded but the lease lapsed; leaving message to redeliver"
                        );
                    }
                    None
                }
            }));
        }

        // Deletes are amortized: settle the whole receive batch, then issue
        // batched deletes.
        let mut to_delete = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(Some(handle)) => to_delete.push(handle),
                Ok(None) => {}
                Err(err) => {
                    error!(
                        queue_url = %self.queue_url,
                        error = %err,
                        "message handler task panicked; message left to redeliver"
                    );
                    self.stats.handled_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.delete_settled(to_delete).await;
    }

    /// Delete settled messages in batches of at most ten, retrying transient
    /// per-handle failures a bounded number of times.
    async fn delete_settled(&self, handles: Vec<String>) {
        for chunk in handles.chunks(MAX_BATCH_ENTRIES) {
            let mut pending: Vec<String> = chunk.to_vec();
            let mut backoff = Backoff::new(DELETE_RETRY_BASE, DELETE_RETRY_CAP);

            for attempt in 1..=DELETE_RETRY_ATTEMPTS {
                match self.client.delete_batch(&self.queue_url, &pending).await {
                    Ok(outcome) => {
                        self.stats
                            .deleted
                            .fetch_add(outcome.deleted.len() as u64, Ordering::Relaxed);

                        let mut retry = Vec::new();
                        for (handle, err) in outcome.failed {
                            match err {
                                QueueError::InvalidHandle(_) => {
                                    // The handle expired under us; redelivery
                                    // will settle this message.
                                    warn!(
                                        queue_url = %self.queue_url,
                                        receipt_handle = %handle,
                                        "receipt handle expired during delete"
                                    );
                                }
                                err if err.is_retryable() && attempt < DELETE_RETRY_ATTEMPTS => {
                                    retry.push(handle);
                                }
                                err => {
                                    error!(
                                        queue_url = %self.queue_url,
                                        receipt_handle = %handle,
                                        error = %err,
                                        "delete failed; message will redeliver"
                                    );
                                }
                            }
                        }
                        pending = retry;
                    }
                    Err(err) if err.is_retryable() && attempt < DELETE_RETRY_ATTEMPTS => {
                        warn!(
                            queue_url = %self.queue_url,
                            error = %err,
                            attempt = attempt,
                            "batch delete failed, retrying"
                        );
                    }
                    Err(err) => {
                        error!(
                            queue_url = %self.queue_url,
                            error = %err,
                            count = pending.len(),
                            "giving up on batch delete; messages will redeliver"
                        );
                        pending.clear();
                    }
                }

                if pending.is_empty() {
                    break;
                }
                tokio::time::sleep(backoff.delay()).await;
            }
        }
    }

    /// Make handler-reported failures immediately re-deliverable by zeroing
    /// their visibility.
    async fn release(&self, failed: &HashSet<String>) {
        for handle in failed {
            if let Err(err) = self.client.change_visibility(&self.queue_url, handle, 0).await {
                warn!(
                    queue_url = %self.queue_url,
                    receipt_handle = %handle,
                    error = %err,
                    "failed to release message for immediate redelivery"
                );
            }
        }
    }
}
