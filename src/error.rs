//! Error types for the feed bridge.

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// Errors from the messaging-bus adapter.
#[derive(Debug, Error)]
pub enum BusError {
    /// The benign end-of-partition signal; ends a polling window cleanly.
    #[error("reached end of partition {partition}")]
    PartitionEof { partition: i32 },

    #[error("failed to connect consumer: {message}")]
    Connect { message: String },

    #[error("consumer error: {message}")]
    Consumer { message: String },

    #[error("failed to commit offsets: {message}")]
    Commit { message: String },
}

impl BusError {
    /// Whether this is the end-of-partition signal rather than a real fault.
    pub fn is_partition_eof(&self) -> bool {
        matches!(self, BusError::PartitionEof { .. })
    }
}

impl From<KafkaError> for BusError {
    fn from(err: KafkaError) -> Self {
        match err {
            KafkaError::PartitionEOF(partition) => BusError::PartitionEof { partition },
            other => BusError::Consumer {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from webhook delivery.
///
/// HTTP statuses are not errors here: the worker classifies them off the
/// response. These variants cover the cases where no response came back.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("invalid webhook url: {message}")]
    InvalidUrl { message: String },
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebhookError::Timeout
        } else {
            WebhookError::Network(err)
        }
    }
}

/// Errors from the one-shot produce action.
///
/// The `Display` strings are the user-visible action results, so they keep
/// the wording callers already match on.
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("You must supply all of the following parameters: {0}")]
    MissingParameters(String),

    #[error("{param} parameter is not Base64 encoded")]
    NotBase64 { param: &'static str },

    #[error("No brokers available. Check that your supplied brokers are correct and available.")]
    NoBrokersAvailable,

    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("timed out waiting for message delivery")]
    Timeout,

    #[error("{message}")]
    Kafka { message: String },
}

impl ProduceError {
    pub(crate) fn from_kafka(err: &KafkaError) -> Self {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown)
            | Some(RDKafkaErrorCode::BrokerTransportFailure) => ProduceError::NoBrokersAvailable,
            Some(RDKafkaErrorCode::Authentication)
            | Some(RDKafkaErrorCode::SaslAuthenticationFailed) => ProduceError::AuthenticationFailed {
                message: err.to_string(),
            },
            Some(RDKafkaErrorCode::MessageTimedOut) | Some(RDKafkaErrorCode::OperationTimedOut) => {
                ProduceError::Timeout
            }
            _ => ProduceError::Kafka {
                message: err.to_string(),
            },
        }
    }
}

/// Error from the trigger-metadata store.
#[derive(Debug, Error)]
#[error("database error: {message}")]
pub struct DatabaseError {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_eof_is_benign() {
        assert!(BusError::PartitionEof { partition: 3 }.is_partition_eof());
        assert!(!BusError::Consumer {
            message: "broke".to_string()
        }
        .is_partition_eof());
    }

    #[test]
    fn test_missing_parameters_message() {
        let err = ProduceError::MissingParameters("topic".to_string());
        assert_eq!(
            err.to_string(),
            "You must supply all of the following parameters: topic"
        );
    }

    #[test]
    fn test_not_base64_message() {
        let err = ProduceError::NotBase64 { param: "value" };
        assert_eq!(err.to_string(), "value parameter is not Base64 encoded");
    }
}
