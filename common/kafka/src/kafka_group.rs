//! Consumer group runtime backed by librdkafka.
//!
//! librdkafka owns group membership, partition assignment, SASL authentication
//! and background offset commits. This module layers the generation/claim model
//! of [`crate::group`] on top: every assignment becomes a generation with one
//! claim task per partition, records are routed to their partition's task in
//! order, and marked records have `offset + 1` stored for the next auto-commit.
//!
//! A partition whose claim falls behind is paused rather than blocking the poll
//! loop, and a generation that ends while the member keeps running rewinds every
//! partition to its first unhandled record.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::GroupError;
use crate::group::{Claim, ClaimHandler, ConsumerGroup, GroupConnector, GroupSession, Record};
use crate::scram::{SaslClient, ScramClient, ScramMechanism};

const CLAIM_BUFFER: usize = 64;
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const REBALANCES: &str = "kafka_rebalances_total";
const OFFSET_STORE_FAILURES: &str = "kafka_offset_store_failures_total";
const PARTITION_PAUSES: &str = "kafka_partition_pauses_total";
const PARTITION_REWINDS: &str = "kafka_partition_rewinds_total";

type PartitionKey = (String, i32);

pub struct GroupContext {
    errors: Mutex<Option<mpsc::UnboundedSender<GroupError>>>,
    rebalances: watch::Sender<u64>,
}

impl GroupContext {
    fn new(errors: mpsc::UnboundedSender<GroupError>) -> Self {
        let (rebalances, _) = watch::channel(0);
        Self {
            errors: Mutex::new(Some(errors)),
            rebalances,
        }
    }

    fn report(&self, error: GroupError) {
        let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        match errors.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(error) {
                    debug!("dropping consumer group error, nobody is watching: {}", e.0);
                }
            }
            None => debug!("dropping consumer group error after close: {}", error),
        }
    }

    fn close_errors(&self) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn bump_generation(&self, kind: &'static str) {
        metrics::counter!(REBALANCES, "kind" => kind).increment(1);
        self.rebalances.send_modify(|generation| *generation += 1);
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        self.report(GroupError::Client {
            error,
            reason: reason.to_owned(),
        });
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(partitions = partitions.count(), "partitions revoked");
                self.bump_generation("revoke");
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                self.report(GroupError::Rebalance(e.to_string()));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!(partitions = partitions.count(), "partitions assigned");
            self.bump_generation("assign");
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {}
            // auto-commit with nothing new stored
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => self.report(GroupError::Kafka(e)),
        }
    }
}

struct Inner {
    consumer: StreamConsumer<GroupContext>,
}

/// A consumer group member. Dropping the last handle leaves the group.
pub struct KafkaGroup {
    inner: Arc<Inner>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
    subscribed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl KafkaGroup {
    pub async fn connect(config: &KafkaConfig, group_id: &str) -> Result<Self, GroupError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.kafka_hosts.as_str())
            .set("group.id", group_id)
            .set("client.id", &config.kafka_client_id)
            .set("broker.version.fallback", &config.kafka_protocol_version)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.kafka_auto_commit_interval.as_millis_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout.as_millis_string(),
            )
            .set(
                "heartbeat.interval.ms",
                config.kafka_heartbeat_interval.as_millis_string(),
            )
            .set(
                "fetch.error.backoff.ms",
                config.kafka_fetch_retry_backoff.as_millis_string(),
            )
            .set(
                "retry.backoff.ms",
                config.kafka_metadata_retry_backoff.as_millis_string(),
            )
            .set(
                "socket.timeout.ms",
                config.kafka_socket_timeout.as_millis_string(),
            )
            .set(
                "socket.connection.setup.timeout.ms",
                config.kafka_dial_timeout.as_millis_string(),
            );

        if config.kafka_sasl_enabled {
            let mechanism: ScramMechanism = config.kafka_sasl_mechanism.parse()?;

            // A fresh conversation per attempt; rejects unusable credentials
            // before any broker round-trip.
            let mut scram = ScramClient::new(mechanism);
            scram.begin(
                &config.kafka_sasl_username,
                &config.kafka_sasl_password,
                "",
            )?;

            let protocol = if config.kafka_tls {
                "sasl_ssl"
            } else {
                "sasl_plaintext"
            };
            client_config
                .set("security.protocol", protocol)
                .set("sasl.mechanism", scram.mechanism())
                .set("sasl.username", &config.kafka_sasl_username)
                .set("sasl.password", &config.kafka_sasl_password);
        } else if config.kafka_tls {
            client_config.set("security.protocol", "ssl");
        }

        if config.kafka_tls {
            client_config.set("enable.ssl.certificate.verification", "false");
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<GroupContext> =
            client_config.create_with_context(GroupContext::new(errors_tx))?;
        let inner = Arc::new(Inner { consumer });

        // "Ping" the brokers; also surfaces authentication failures
        let ping = inner.clone();
        let timeout = config.kafka_dial_timeout.0;
        let metadata = tokio::task::spawn_blocking(move || {
            ping.consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.topics().len())
        })
        .await
        .map_err(|e| GroupError::Unavailable(format!("metadata task failed: {e}")))??;

        info!(
            group_id,
            topics = metadata,
            "connected to kafka brokers"
        );

        Ok(Self {
            inner,
            errors: Mutex::new(Some(errors_rx)),
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> Result<(), GroupError> {
        let mut subscribed = self
            .subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribed.as_slice() != topics {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.inner.consumer.subscribe(&names)?;
            *subscribed = topics.to_vec();
            info!(topics = ?names, "subscribed");
        }
        Ok(())
    }

    fn assignment(&self) -> Result<HashMap<String, Vec<i32>>, GroupError> {
        let assignment = self.inner.consumer.assignment()?;
        let mut claims: HashMap<String, Vec<i32>> = HashMap::new();
        for element in assignment.elements() {
            claims
                .entry(element.topic().to_owned())
                .or_default()
                .push(element.partition());
        }
        Ok(claims)
    }
}

enum Event {
    Cancelled,
    Rebalanced,
    Drained(PartitionKey, Result<mpsc::OwnedPermit<Record>, SendError<()>>),
    Received(Record),
    Failed(KafkaError),
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), GroupError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        self.ensure_subscribed(topics)?;

        let consumer = &self.inner.consumer;
        let mut rebalances = consumer.context().rebalances.subscribe();
        let mut generation: Option<Generation> = None;

        let result = loop {
            if generation.is_none() {
                let claims = self.assignment()?;
                if !claims.is_empty() {
                    rebalances.borrow_and_update();
                    generation =
                        Some(Generation::begin(&self.inner, claims, cancel, handler.clone()).await?);
                }
            }

            let backlogged = generation.as_ref().map(Generation::backlogged).unwrap_or_default();
            let has_backlog = !backlogged.is_empty();

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                _ = rebalances.changed(), if generation.is_some() => Event::Rebalanced,
                (key, permit) = next_free_feed(backlogged), if has_backlog => Event::Drained(key, permit),
                message = consumer.recv() => match message {
                    Ok(message) => Event::Received(to_record(&message)),
                    Err(e) => Event::Failed(e),
                },
            };

            match event {
                Event::Cancelled => break Ok(()),
                Event::Rebalanced => {
                    debug!("generation ended by rebalance");
                    break Ok(());
                }
                Event::Failed(e) => break Err(GroupError::Kafka(e)),
                Event::Drained(key, permit) => {
                    if let Some(generation) = generation.as_mut() {
                        generation.drain(key, permit);
                    }
                }
                Event::Received(record) => {
                    if generation.is_none() {
                        let claims = self.assignment()?;
                        rebalances.borrow_and_update();
                        generation = Some(
                            Generation::begin(&self.inner, claims, cancel, handler.clone()).await?,
                        );
                    }
                    if let Some(generation) = generation.as_mut() {
                        generation.route(record);
                    }
                }
            }
        };

        if let Some(generation) = generation {
            let leftover = generation.finish().await;
            // a closing member leaves uncommitted records to the next owner
            if !cancel.is_cancelled() {
                restore_positions(&self.inner, leftover).await;
            }
        }

        result
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> Result<(), GroupError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.consumer.unsubscribe();
        self.inner.consumer.context().close_errors();
        info!("consumer group closed");
        Ok(())
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Waits until one of the backlogged feeds has room again.
async fn next_free_feed(
    backlogged: Vec<(PartitionKey, mpsc::Sender<Record>)>,
) -> (PartitionKey, Result<mpsc::OwnedPermit<Record>, SendError<()>>) {
    if backlogged.is_empty() {
        return std::future::pending().await;
    }
    let waiting = backlogged
        .into_iter()
        .map(|(key, feed)| Box::pin(async move { (key, feed.reserve_owned().await) }));
    let (ready, _, _) = futures::future::select_all(waiting).await;
    ready
}

fn partition_list(keys: &[PartitionKey]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for (topic, partition) in keys {
        list.add_partition(topic, *partition);
    }
    list
}

/// First and last offset routed to a partition during one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoutedRange {
    first: i64,
    last: i64,
}

/// What a finished generation leaves behind for the fetcher.
#[derive(Debug, Default, PartialEq, Eq)]
struct Leftover {
    /// Partitions to seek back to their first unhandled offset.
    rewind: Vec<(PartitionKey, i64)>,
    /// Partitions still paused for backpressure.
    paused: Vec<PartitionKey>,
}

/// One assignment's worth of claims.
struct Generation {
    inner: Arc<Inner>,
    session: Arc<KafkaSession>,
    handler: Arc<dyn ClaimHandler>,
    feeds: HashMap<PartitionKey, mpsc::Sender<Record>>,
    routed: HashMap<PartitionKey, RoutedRange>,
    // records held back while their partition is paused, in fetch order
    backlog: HashMap<PartitionKey, VecDeque<Record>>,
    tasks: JoinSet<()>,
}

impl Generation {
    async fn begin(
        inner: &Arc<Inner>,
        claims: HashMap<String, Vec<i32>>,
        cancel: &CancellationToken,
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<Self, GroupError> {
        let session = Arc::new(KafkaSession {
            handle: Arc::downgrade(inner),
            claims,
            marked: Mutex::new(HashMap::new()),
            cancel: cancel.child_token(),
        });
        handler
            .setup(session.as_ref())
            .await
            .map_err(GroupError::Claim)?;

        let mut generation = Self {
            inner: inner.clone(),
            session,
            handler,
            feeds: HashMap::new(),
            routed: HashMap::new(),
            backlog: HashMap::new(),
            tasks: JoinSet::new(),
        };
        let assigned: Vec<PartitionKey> = generation
            .session
            .claims
            .iter()
            .flat_map(|(topic, partitions)| partitions.iter().map(|p| (topic.clone(), *p)))
            .collect();
        for (topic, partition) in assigned {
            generation.open_claim(topic, partition);
        }

        Ok(generation)
    }

    fn open_claim(&mut self, topic: String, partition: i32) -> mpsc::Sender<Record> {
        let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
        let claim = Claim::new(topic.clone(), partition, rx);
        let handler = self.handler.clone();
        let session = self.session.clone();

        self.tasks.spawn(async move {
            let topic = claim.topic().to_owned();
            if let Err(e) = handler.consume_claim(session.as_ref(), claim).await {
                error!(topic, partition, error = %e, "claim consumer failed");
            }
        });
        self.feeds.insert((topic, partition), tx.clone());
        tx
    }

    /// Hand a record to its partition's claim without ever waiting on it.
    fn route(&mut self, record: Record) {
        let key = (record.topic.clone(), record.partition);
        self.routed
            .entry(key.clone())
            .and_modify(|range| range.last = record.offset)
            .or_insert(RoutedRange {
                first: record.offset,
                last: record.offset,
            });

        if let Some(backlog) = self.backlog.get_mut(&key) {
            backlog.push_back(record);
            return;
        }

        let feed = match self.feeds.get(&key) {
            Some(feed) => feed.clone(),
            None => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    "record for a partition outside the session claims"
                );
                self.open_claim(key.0.clone(), key.1)
            }
        };

        match feed.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.pause(&key);
                self.backlog.entry(key).or_default().push_back(record);
            }
            Err(TrySendError::Closed(record)) => {
                warn!(offset = record.offset, "claim feed closed, record will be redelivered");
            }
        }
    }

    fn backlogged(&self) -> Vec<(PartitionKey, mpsc::Sender<Record>)> {
        self.backlog
            .keys()
            .filter_map(|key| self.feeds.get(key).map(|feed| (key.clone(), feed.clone())))
            .collect()
    }

    /// Move one held-back record into a feed that has room again; resume the
    /// partition once its backlog is empty.
    fn drain(
        &mut self,
        key: PartitionKey,
        permit: Result<mpsc::OwnedPermit<Record>, SendError<()>>,
    ) {
        let Ok(permit) = permit else {
            warn!(
                topic = %key.0,
                partition = key.1,
                "claim feed closed, held records will be redelivered"
            );
            self.backlog.remove(&key);
            return;
        };
        let Some(backlog) = self.backlog.get_mut(&key) else {
            return;
        };
        if let Some(record) = backlog.pop_front() {
            permit.send(record);
        }
        if backlog.is_empty() {
            self.backlog.remove(&key);
            self.resume(&key);
        }
    }

    fn pause(&self, key: &PartitionKey) {
        metrics::counter!(PARTITION_PAUSES).increment(1);
        debug!(topic = %key.0, partition = key.1, "claim is behind, pausing partition");
        if let Err(e) = self.inner.consumer.pause(&partition_list(std::slice::from_ref(key))) {
            warn!(topic = %key.0, partition = key.1, error = %e, "failed to pause partition");
        }
    }

    fn resume(&self, key: &PartitionKey) {
        debug!(topic = %key.0, partition = key.1, "claim caught up, resuming partition");
        if let Err(e) = self.inner.consumer.resume(&partition_list(std::slice::from_ref(key))) {
            warn!(topic = %key.0, partition = key.1, error = %e, "failed to resume partition");
        }
    }

    /// End the session, close every feed, wait for the claim tasks, then clean up.
    /// Returns where each partition has to resume so no fetched record is skipped.
    async fn finish(mut self) -> Leftover {
        self.session.cancel.cancel();
        self.feeds.clear();

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("claim task panicked: {}", e);
            }
        }

        if let Err(e) = self.handler.cleanup(self.session.as_ref()).await {
            error!("claim handler cleanup failed: {:#}", e);
        }

        let marked = self
            .session
            .marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut rewind: Vec<(PartitionKey, i64)> = self
            .routed
            .iter()
            .filter_map(|(key, range)| {
                let resume = marked.get(key).map_or(range.first, |offset| offset + 1);
                (resume <= range.last).then(|| (key.clone(), resume))
            })
            .collect();
        rewind.sort();
        let mut paused: Vec<PartitionKey> = self.backlog.keys().cloned().collect();
        paused.sort();

        Leftover { rewind, paused }
    }
}

/// Seek partitions back to their first unhandled record and lift any pause.
/// Partitions no longer assigned are left to their next owner.
async fn restore_positions(inner: &Arc<Inner>, leftover: Leftover) {
    if leftover == Leftover::default() {
        return;
    }
    let inner = inner.clone();
    let restored = tokio::task::spawn_blocking(move || {
        for ((topic, partition), offset) in &leftover.rewind {
            match inner
                .consumer
                .seek(topic, *partition, Offset::Offset(*offset), SEEK_TIMEOUT)
            {
                Ok(()) => {
                    metrics::counter!(PARTITION_REWINDS).increment(1);
                    info!(topic, partition, offset, "rewound partition to first unhandled record");
                }
                Err(e) => warn!(topic, partition, offset, error = %e, "failed to rewind partition"),
            }
        }
        if !leftover.paused.is_empty() {
            if let Err(e) = inner.consumer.resume(&partition_list(&leftover.paused)) {
                debug!(error = %e, "failed to resume partitions after generation end");
            }
        }
    })
    .await;
    if let Err(e) = restored {
        error!("partition restore task failed: {}", e);
    }
}

struct KafkaSession {
    handle: Weak<Inner>,
    claims: HashMap<String, Vec<i32>>,
    // last handled offset per partition
    marked: Mutex<HashMap<PartitionKey, i64>>,
    cancel: CancellationToken,
}

impl GroupSession for KafkaSession {
    fn claims(&self) -> HashMap<String, Vec<i32>> {
        self.claims.clone()
    }

    fn mark_message(&self, record: &Record) {
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((record.topic.clone(), record.partition), record.offset);

        let Some(inner) = self.handle.upgrade() else {
            warn!(offset = record.offset, "consumer gone, offset not stored");
            return;
        };
        // the committed offset is the next one to read
        if let Err(e) = inner
            .consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)
        {
            metrics::counter!(OFFSET_STORE_FAILURES).increment(1);
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "failed to store offset"
            );
        }
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Dials [`KafkaGroup`]s for one group id.
pub struct KafkaGroupConnector {
    config: KafkaConfig,
    group_id: String,
}

impl KafkaGroupConnector {
    pub fn new(config: KafkaConfig, group_id: impl Into<String>) -> Self {
        Self {
            config,
            group_id: group_id.into(),
        }
    }
}

#[async_trait]
impl GroupConnector for KafkaGroupConnector {
    async fn connect(&self) -> Result<Arc<dyn ConsumerGroup>, GroupError> {
        let group = KafkaGroup::connect(&self.config, &self.group_id).await?;
        Ok(Arc::new(group))
    }
}
