use std::error::Error as StdError;

use aws_sdk_s3::error::DisplayErrorContext;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the AWS helpers.
#[derive(Error, Debug)]
pub enum Error {
    /// A call to an AWS service failed.
    #[error("{service} error: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    /// The service answered without a field the helper depends on.
    #[error("{service} response is missing {field}")]
    MissingField {
        service: &'static str,
        field: &'static str,
    },

    /// `Queue` was used before `subscribe_topic` resolved its URL.
    #[error("no subscribed queue, call subscribe_topic first")]
    NotSubscribed,

    /// The queue policy does not have the shape of an IAM policy document.
    #[error("invalid queue policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid listener options: {0}")]
    InvalidOptions(String),

    #[error("no topic registered for event type {0}")]
    UnmappedEvent(&'static str),

    /// A message handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid utf-8 content: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl Error {
    /// Wraps an SDK error, keeping the full source chain in the message.
    pub(crate) fn service<E>(service: &'static str, err: E) -> Self
    where
        E: StdError,
    {
        Error::Service {
            service,
            message: DisplayErrorContext(err).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "dispatch failure")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn service_error_keeps_source_chain() {
        let err = Error::service(
            "sqs",
            Outer(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
        );
        let text = err.to_string();
        assert!(text.starts_with("sqs error: dispatch failure"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn json_errors_convert() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Json(_)));
    }
}
