use std::collections::HashMap;

use async_trait::async_trait;
use drover_common::Message;

pub mod error;
pub mod sqs;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// SQS caps batch operations at ten entries per call.
pub const MAX_BATCH_ENTRIES: usize = 10;

/// Parameters for a single receive call.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    /// Maximum messages per receive (SQS allows 1-10).
    pub max_messages: i32,
    /// Long-poll duration in seconds (SQS allows 0-20).
    pub wait_time_seconds: i32,
    /// Initial visibility timeout set on received messages.
    pub visibility_timeout_seconds: i32,
}

/// Per-handle outcome of a batch delete.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, QueueError)>,
}

/// Per-handle outcome of a batch visibility change.
#[derive(Debug, Default)]
pub struct VisibilityOutcome {
    pub changed: Vec<String>,
    pub failed: Vec<(String, QueueError)>,
}

/// The narrow queue-service surface the runtime depends on.
///
/// Implementations must be safe for concurrent use; the same client is
/// shared by every poller, dispatcher, and heartbeat in the process. Test
/// doubles implement this trait over an in-memory queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for up to `opts.max_messages` messages. Blocks up to
    /// `opts.wait_time_seconds` and may return an empty batch.
    async fn receive(&self, queue_url: &str, opts: ReceiveOptions) -> Result<Vec<Message>>;

    /// Delete up to [`MAX_BATCH_ENTRIES`] messages by receipt handle.
    /// Returns per-handle results; a top-level error means the whole call
    /// failed.
    async fn delete_batch(&self, queue_url: &str, handles: &[String]) -> Result<DeleteOutcome>;

    /// Reset the visibility timeout of one message. The new timeout replaces
    /// whatever remained; passing zero makes the message immediately
    /// re-deliverable.
    async fn change_visibility(
        &self,
        queue_url: &str,
        handle: &str,
        timeout_seconds: i32,
    ) -> Result<()>;

    /// Batched visibility change for up to [`MAX_BATCH_ENTRIES`] handles.
    async fn change_visibility_batch(
        &self,
        queue_url: &str,
        entries: &[(String, i32)],
    ) -> Result<VisibilityOutcome>;

    /// Queue attributes, used at startup for logging queue depth.
    async fn get_queue_attributes(&self, queue_url: &str) -> Result<HashMap<String, String>>;
}
