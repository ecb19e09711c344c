//! AWS SQS implementation of the queue client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::{
    ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry,
    MessageSystemAttributeName, QueueAttributeName,
};
use aws_sdk_sqs::Client;
use tracing::{debug, warn};

use drover_common::{Message, MessageAttribute};

use crate::error::{classify_code, classify_sdk_error};
use crate::{
    DeleteOutcome, QueueClient, QueueError, ReceiveOptions, Result, VisibilityOutcome,
    MAX_BATCH_ENTRIES,
};

/// Timeout applied to every non-receive call.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// AWS SQS queue client.
///
/// Thin wrapper over the SDK client that classifies errors into the runtime
/// taxonomy, applies per-call timeouts, and keeps lifetime counters.
pub struct SqsQueueClient {
    client: Client,
    /// Total messages returned by receive calls.
    total_received: AtomicU64,
    /// Total messages successfully deleted.
    total_deleted: AtomicU64,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            total_received: AtomicU64::new(0),
            total_deleted: AtomicU64::new(0),
        }
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn total_deleted(&self) -> u64 {
        self.total_deleted.load(Ordering::Relaxed)
    }

    async fn with_timeout<T, F>(&self, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Transient(format!(
                "queue service call timed out after {limit:?}"
            ))),
        }
    }

    fn parse_message(sqs_msg: aws_sdk_sqs::types::Message) -> Option<Message> {
        let message_id = sqs_msg.message_id.unwrap_or_default();
        let Some(receipt_handle) = sqs_msg.receipt_handle else {
            warn!(message_id = %message_id, "received message without receipt handle, skipping");
            return None;
        };
        let Some(body) = sqs_msg.body else {
            warn!(message_id = %message_id, "received message without body, skipping");
            return None;
        };

        let attributes: HashMap<String, MessageAttribute> = sqs_msg
            .message_attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| {
                let attribute = MessageAttribute {
                    data_type: value.data_type().to_string(),
                    string_value: value.string_value().unwrap_or_default().to_string(),
                };
                (name, attribute)
            })
            .collect();

        Some(Message::new(message_id, receipt_handle, body, attributes))
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(&self, queue_url: &str, opts: ReceiveOptions) -> Result<Vec<Message>> {
        // Long polls get twice the wait time before the local timeout fires,
        // so a slow-but-alive call is not cut off mid-poll.
        let receive_timeout =
            Duration::from_secs((2 * opts.wait_time_seconds.max(0) as u64).max(10));

        let output = self
            .with_timeout(receive_timeout, async {
                self.client
                    .receive_message()
                    .queue_url(queue_url)
                    .max_number_of_messages(opts.max_messages.clamp(1, MAX_BATCH_ENTRIES as i32))
                    .wait_time_seconds(opts.wait_time_seconds.clamp(0, 20))
                    .visibility_timeout(opts.visibility_timeout_seconds)
                    .message_system_attribute_names(MessageSystemAttributeName::All)
                    .message_attribute_names("All")
                    .send()
                    .await
                    .map_err(classify_sdk_error)
            })
            .await?;

        let messages: Vec<Message> = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(Self::parse_message)
            .collect();

        if !messages.is_empty() {
            self.total_received
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(queue_url = %queue_url, count = messages.len(), "received messages");
        }

        Ok(messages)
    }

    async fn delete_batch(&self, queue_url: &str, handles: &[String]) -> Result<DeleteOutcome> {
        debug_assert!(handles.len() <= MAX_BATCH_ENTRIES);
        if handles.is_empty() {
            return Ok(DeleteOutcome::default());
        }

        // Entry ids are the handle's index in the request, so per-entry
        // results can be mapped back to receipt handles.
        let mut entries = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            let entry = DeleteMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(handle)
                .build()
                .map_err(|e| QueueError::Fatal(format!("invalid delete entry: {e}")))?;
            entries.push(entry);
        }

        let output = self
            .with_timeout(CALL_TIMEOUT, async {
                self.client
                    .delete_message_batch()
                    .queue_url(queue_url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map_err(classify_sdk_error)
            })
            .await?;

        let mut outcome = DeleteOutcome::default();
        for entry in &output.successful {
            if let Some(handle) = lookup_handle(handles, entry.id()) {
                outcome.deleted.push(handle.to_string());
            }
        }
        for entry in &output.failed {
            if let Some(handle) = lookup_handle(handles, entry.id()) {
                let error = classify_code(
                    Some(entry.code()),
                    entry.message().unwrap_or("batch delete entry failed").to_string(),
                );
                outcome.failed.push((handle.to_string(), error));
            }
        }

        self.total_deleted
            .fetch_add(outcome.deleted.len() as u64, Ordering::Relaxed);
        debug!(
            queue_url = %queue_url,
            deleted = outcome.deleted.len(),
            failed = outcome.failed.len(),
            "batch delete complete"
        );

        Ok(outcome)
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        handle: &str,
        timeout_seconds: i32,
    ) -> Result<()> {
        self.with_timeout(CALL_TIMEOUT, async {
            self.client
                .change_message_visibility()
                .queue_url(queue_url)
                .receipt_handle(handle)
                .visibility_timeout(timeout_seconds)
                .send()
                .await
                .map_err(classify_sdk_error)
        })
        .await?;

        debug!(
            queue_url = %queue_url,
            timeout_seconds = timeout_seconds,
            "visibility changed"
        );
        Ok(())
    }

    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[(String, i32)],
    ) -> Result<VisibilityOutcome> {
        debug_assert!(entries.len() <= MAX_BATCH_ENTRIES);
        if entries.is_empty() {
            return Ok(VisibilityOutcome::default());
        }

        let handles: Vec<String> = entries.iter().map(|(handle, _)| handle.clone()).collect();

        let mut request_entries = Vec::with_capacity(entries.len());
        for (index, (handle, timeout_seconds)) in entries.iter().enumerate() {
            let entry = ChangeMessageVisibilityBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(handle)
                .visibility_timeout(*timeout_seconds)
                .build()
                .map_err(|e| QueueError::Fatal(format!("invalid visibility entry: {e}")))?;
            request_entries.push(entry);
        }

        let output = self
            .with_timeout(CALL_TIMEOUT, async {
                self.client
                    .change_message_visibility_batch()
                    .queue_url(queue_url)
                    .set_entries(Some(request_entries))
                    .send()
                    .await
                    .map_err(classify_sdk_error)
            })
            .await?;

        let mut outcome = VisibilityOutcome::default();
        for entry in &output.successful {
            if let Some(handle) = lookup_handle(&handles, entry.id()) {
                outcome.changed.push(handle.to_string());
            }
        }
        for entry in &output.failed {
            if let Some(handle) = lookup_handle(&handles, entry.id()) {
                let error = classify_code(
                    Some(entry.code()),
                    entry
                        .message()
                        .unwrap_or("batch visibility entry failed")
                        .to_string(),
                );
                outcome.failed.push((handle.to_string(), error));
            }
        }

        Ok(outcome)
    }

    async fn get_queue_attributes(&self, queue_url: &str) -> Result<HashMap<String, String>> {
        let output = self
            .with_timeout(CALL_TIMEOUT, async {
                self.client
                    .get_queue_attributes()
                    .queue_url(queue_url)
                    .attribute_names(QueueAttributeName::All)
                    .send()
                    .await
                    .map_err(classify_sdk_error)
            })
            .await?;

        Ok(output
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name.as_str().to_string(), value))
            .collect())
    }
}

/// Map a batch entry id (the request index) back to its receipt handle.
fn lookup_handle<'a>(handles: &'a [String], id: &str) -> Option<&'a str> {
    let index: usize = match id.parse() {
        Ok(index) => index,
        Err(_) => {
            warn!(entry_id = %id, "unrecognized batch entry id in queue service response");
            return None;
        }
    };
    handles.get(index).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_handle_maps_index_ids() {
        let handles = vec!["rh-a".to_string(), "rh-b".to_string()];
        assert_eq!(lookup_handle(&handles, "0"), Some("rh-a"));
        assert_eq!(lookup_handle(&handles, "1"), Some("rh-b"));
        assert_eq!(lookup_handle(&handles, "2"), None);
        assert_eq!(lookup_handle(&handles, "garbage"), None);
    }
}
