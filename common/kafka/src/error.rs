use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::scram::SaslError;

/// Returned when a blocking operation was abandoned because its scope was cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Errors raised by a consumer group session, either from `consume` or
/// asynchronously through the group's error stream.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("kafka client error: {reason}: {error}")]
    Client { error: KafkaError, reason: String },
    #[error("sasl credentials rejected: {0}")]
    Credential(#[from] SaslError),
    #[error("rebalance failed: {0}")]
    Rebalance(String),
    #[error("claim handler failed: {0:#}")]
    Claim(anyhow::Error),
    #[error("consumer group is closed")]
    Closed,
    #[error("consumer group unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one isolated message handler invocation.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("handler panic: {0}")]
    Panic(String),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("consumer cancelled")]
    Cancelled,
    #[error("consumer is already running")]
    AlreadyRunning,
}

impl ConsumerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumerError::Cancelled)
    }
}

impl From<Cancelled> for ConsumerError {
    fn from(_: Cancelled) -> Self {
        ConsumerError::Cancelled
    }
}
