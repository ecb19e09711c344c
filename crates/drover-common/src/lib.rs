use std::collections::{HashMap, HashSet};

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod logging;

/// A single message attribute as returned by the queue service.
///
/// SQS models attributes as a `{DataType, StringValue}` pair; binary
/// attribute values are not carried through this runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttribute {
    pub data_type: String,
    pub string_value: String,
}

/// A message received from the queue, immutable after construction.
///
/// The receipt handle is only valid for the reception that produced this
/// value; once the message has been deleted or its visibility has expired,
/// the handle is dead and any settlement call using it will fail.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: String,
    receipt_handle: String,
    body: String,
    attributes: HashMap<String, MessageAttribute>,
    json: OnceCell<Result<Value, PayloadError>>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
        attributes: HashMap<String, MessageAttribute>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes,
            json: OnceCell::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    /// The raw UTF-8 body.
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attributes(&self) -> &HashMap<String, MessageAttribute> {
        &self.attributes
    }

    /// The body parsed as JSON.
    ///
    /// The parse result is memoized on first access; repeated calls return
    /// the cached value without re-parsing.
    pub fn as_json(&self) -> Result<&Value, PayloadError> {
        self.json
            .get_or_init(|| serde_json::from_str(&self.body).map_err(PayloadError::from))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// The body parsed as JSON, or `None` when the body is not valid JSON.
    pub fn try_json(&self) -> Option<&Value> {
        self.as_json().ok()
    }

    /// Deserialize the body into a concrete type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_str(&self.body).map_err(PayloadError::from)
    }
}

/// The message body could not be parsed as JSON.
///
/// Stores the rendered parse error so the memoized result stays cloneable.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid JSON payload: {reason}")]
pub struct PayloadError {
    reason: String,
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            reason: err.to_string(),
        }
    }
}

/// Outcome of a batch handler invocation: the receipt handles the handler
/// marked as failed. An empty result means the whole batch succeeded.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    failed: HashSet<String>,
}

impl BatchResult {
    /// Every message in the batch succeeded.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Mark a receipt handle as failed.
    pub fn fail(mut self, receipt_handle: impl Into<String>) -> Self {
        self.failed.insert(receipt_handle.into());
        self
    }

    /// Mark a message as failed.
    pub fn fail_message(self, message: &Message) -> Self {
        self.fail(message.receipt_handle())
    }

    pub fn failed_handles(&self) -> &HashSet<String> {
        &self.failed
    }

    pub fn is_all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_body(body: &str) -> Message {
        Message::new("m-1", "rh-1", body, HashMap::new())
    }

    #[test]
    fn json_view_is_memoized() {
        let message = message_with_body(r#"{"id": 7}"#);

        let first = message.as_json().unwrap();
        assert_eq!(first["id"], 7);

        // Repeated access must hand back the same cached value.
        let second = message.as_json().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn invalid_body_yields_payload_error_on_every_access() {
        let message = message_with_body("not json at all");

        assert!(message.as_json().is_err());
        assert!(message.as_json().is_err());
        assert!(message.try_json().is_none());
    }

    #[test]
    fn parse_into_concrete_type() {
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u32,
        }

        let message = message_with_body(r#"{"id": 42}"#);
        let payload: Payload = message.parse().unwrap();
        assert_eq!(payload.id, 42);
    }

    #[test]
    fn attributes_are_preserved() {
        let mut attributes = HashMap::new();
        attributes.insert(
            "trace-id".to_string(),
            MessageAttribute {
                data_type: "String".to_string(),
                string_value: "abc-123".to_string(),
            },
        );
        let message = Message::new("m-1", "rh-1", "{}", attributes);

        let attr = &message.attributes()["trace-id"];
        assert_eq!(attr.data_type, "String");
        assert_eq!(attr.string_value, "abc-123");
    }

    #[test]
    fn batch_result_tracks_failed_handles() {
        let result = BatchResult::ok();
        assert!(result.is_all_ok());

        let result = result.fail("rh-2");
        assert!(!result.is_all_ok());
        assert!(result.failed_handles().contains("rh-2"));
    }
}
