use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Classified queue-service errors.
///
/// The classification drives retry behavior throughout the runtime:
/// `Transient` and `Throttled` are retried with backoff, `AuthZ` and
/// `NotFound` end the affected listener, `InvalidHandle` means the receipt
/// handle expired and redelivery will take care of the message.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("transient queue error: {0}")]
    Transient(String),

    #[error("throttled by queue service: {0}")]
    Throttled(String),

    #[error("access denied: {0}")]
    AuthZ(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("invalid or expired receipt handle: {0}")]
    InvalidHandle(String),

    #[error("fatal queue error: {0}")]
    Fatal(String),
}

impl QueueError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Transient(_) | QueueError::Throttled(_))
    }

    /// Whether this error ends the listener that observed it.
    pub fn is_listener_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::AuthZ(_) | QueueError::NotFound(_) | QueueError::Fatal(_)
        )
    }
}

/// Classify an SDK operation error into the runtime taxonomy.
///
/// Network-level failures (dispatch, timeout, malformed response) are
/// transient; service errors are mapped by their error code.
pub(crate) fn classify_sdk_error<E>(err: SdkError<E>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ConstructionFailure(_) => QueueError::Fatal(err.to_string()),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            QueueError::Transient(err.to_string())
        }
        SdkError::ServiceError(_) => classify_code(err.code(), err.to_string()),
        _ => QueueError::Fatal(err.to_string()),
    }
}

/// Map a queue-service error code to the taxonomy.
///
/// Covers both the legacy (`AWS.SimpleQueueService.*`) and the JSON-protocol
/// spellings of the SQS error codes.
pub(crate) fn classify_code(code: Option<&str>, text: String) -> QueueError {
    match code {
        Some(code) if code.contains("Throttl") || code == "RequestThrottled" => {
            QueueError::Throttled(text)
        }
        Some("AccessDenied") | Some("AccessDeniedException") | Some("InvalidSecurity") => {
            QueueError::AuthZ(text)
        }
        Some(code) if code.contains("NonExistentQueue") || code == "QueueDoesNotExist" => {
            QueueError::NotFound(text)
        }
        Some(code)
            if code.contains("ReceiptHandleIsInvalid")
                || code.contains("MessageNotInflight")
                || code == "InvalidReceiptHandle" =>
        {
            QueueError::InvalidHandle(text)
        }
        Some("InternalError") | Some("ServiceUnavailable") => QueueError::Transient(text),
        Some(_) => QueueError::Fatal(text),
        // A service error without a code is indistinguishable from a 5xx;
        // treat it as retryable.
        None => QueueError::Transient(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_classification() {
        assert!(matches!(
            classify_code(Some("RequestThrottled"), String::new()),
            QueueError::Throttled(_)
        ));
        assert!(matches!(
            classify_code(Some("ThrottlingException"), String::new()),
            QueueError::Throttled(_)
        ));
        assert!(matches!(
            classify_code(Some("AccessDenied"), String::new()),
            QueueError::AuthZ(_)
        ));
        assert!(matches!(
            classify_code(Some("AWS.SimpleQueueService.NonExistentQueue"), String::new()),
            QueueError::NotFound(_)
        ));
        assert!(matches!(
            classify_code(Some("QueueDoesNotExist"), String::new()),
            QueueError::NotFound(_)
        ));
        assert!(matches!(
            classify_code(Some("ReceiptHandleIsInvalid"), String::new()),
            QueueError::InvalidHandle(_)
        ));
        assert!(matches!(
            classify_code(Some("AWS.SimpleQueueService.MessageNotInflight"), String::new()),
            QueueError::InvalidHandle(_)
        ));
        assert!(matches!(
            classify_code(None, String::new()),
            QueueError::Transient(_)
        ));
        assert!(matches!(
            classify_code(Some("SomethingNovel"), String::new()),
            QueueError::Fatal(_)
        ));
    }

    #[test]
    fn retryability() {
        assert!(QueueError::Transient(String::new()).is_retryable());
        assert!(QueueError::Throttled(String::new()).is_retryable());
        assert!(!QueueError::InvalidHandle(String::new()).is_retryable());

        assert!(QueueError::AuthZ(String::new()).is_listener_fatal());
        assert!(QueueError::NotFound(String::new()).is_listener_fatal());
        assert!(!QueueError::Transient(String::new()).is_listener_fatal());
    }
}
