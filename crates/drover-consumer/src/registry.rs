//! Handler registration.
//!
//! The application constructs a [`Registry`] explicitly and passes it to
//! the supervisor; there is no global registration or import-time side
//! effect. A listener couples a queue URL with a handler in one of two
//! modes and a resolved [`ListenerConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use drover_common::{BatchResult, Message};

use crate::config::ListenerConfig;

/// Batch-mode handler: receives the whole batch in the order the queue
/// service returned it and reports per-handle failures. Returning an error
/// fails the entire batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, messages: &[Message]) -> anyhow::Result<BatchResult>;
}

/// Per-message handler: `Ok(true)` deletes the message, `Ok(false)` leaves
/// it to redeliver, an error leaves it and is logged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<bool>;
}

/// The two dispatch modes, as a tagged variant rather than a mode string.
#[derive(Clone)]
pub enum Handler {
    Batch(Arc<dyn BatchHandler>),
    PerMessage(Arc<dyn MessageHandler>),
}

impl Handler {
    pub fn mode(&self) -> &'static str {
        match self {
            Handler::Batch(_) => "batch",
            Handler::PerMessage(_) => "per_message",
        }
    }
}

/// One registered consumer.
pub struct Listener {
    pub queue_url: String,
    pub handler: Handler,
    pub config: ListenerConfig,
}

/// The set of listeners the supervisor runs.
#[derive(Default)]
pub struct Registry {
    listeners: Vec<Listener>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener, builder-style.
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn into_listeners(self) -> Vec<Listener> {
        self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBatch;

    #[async_trait]
    impl BatchHandler for NoopBatch {
        async fn handle(&self, _messages: &[Message]) -> anyhow::Result<BatchResult> {
            Ok(BatchResult::ok())
        }
    }

    #[test]
    fn registry_collects_listeners() {
        let registry = Registry::new().listener(Listener {
            queue_url: "https://sqs.test/q".to_string(),
            handler: Handler::Batch(Arc::new(NoopBatch)),
            config: ListenerConfig::default(),
        });

        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
        assert_eq!(registry.into_listeners()[0].handler.mode(), "batch");
    }
}
