//! Abstractions over a consumer group session.
//!
//! A [`ConsumerGroup`] joins a group for a set of topics and, for every
//! generation of partition assignments, calls [`ClaimHandler::setup`], runs one
//! [`ClaimHandler::consume_claim`] per assigned partition, and finally calls
//! [`ClaimHandler::cleanup`]. Handlers acknowledge records through
//! [`GroupSession::mark_message`]; only marked records have their offsets
//! committed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GroupError;

/// A single record fetched from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// The ordered stream of records for one assigned partition. The stream ends
/// when the partition is revoked or the session is torn down.
pub struct Claim {
    topic: String,
    partition: i32,
    records: mpsc::Receiver<Record>,
}

impl Claim {
    pub fn new(topic: impl Into<String>, partition: i32, records: mpsc::Receiver<Record>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}

pub trait GroupSession: Send + Sync {
    /// Topic to partitions assigned in this generation.
    fn claims(&self) -> HashMap<String, Vec<i32>>;

    /// Acknowledge a record; its offset becomes eligible for commit.
    fn mark_message(&self, record: &Record);

    /// Cancelled when the generation ends.
    fn cancellation(&self) -> &CancellationToken;
}

#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn setup(&self, session: &dyn GroupSession) -> anyhow::Result<()>;

    async fn cleanup(&self, session: &dyn GroupSession) -> anyhow::Result<()>;

    async fn consume_claim(&self, session: &dyn GroupSession, claim: Claim) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and process a single generation. Returns when the
    /// generation ends through rebalance, cancellation or error.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), GroupError>;

    /// The asynchronous error stream. Only the first caller receives it.
    fn errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>>;

    /// Leave the group and release the client. Ends the error stream.
    async fn close(&self) -> Result<(), GroupError>;
}

/// Creates connected consumer groups.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ConsumerGroup>, GroupError>;
}

/// Processes the payload of a single record.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> anyhow::Result<()>;
}
