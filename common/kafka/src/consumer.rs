use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::{BackoffPolicy, CONSUME_RETRY_DELAY};
use crate::claim::MessageClaimHandler;
use crate::connector::connect_with_retry;
use crate::error::{ConsumerError, GroupError};
use crate::group::{ClaimHandler, GroupConnector, MessageHandler};
use crate::lifecycle::Lifecycle;

const CONSUME_RETRIES: &str = "kafka_consume_retries_total";
const GROUP_ERRORS: &str = "kafka_consumer_group_errors_total";

/// Drives a consumer group: connects with retry, runs one generation after
/// another and shuts everything down in order once cancelled.
pub struct Consumer {
    connector: Arc<dyn GroupConnector>,
    topics: Vec<String>,
    claim_handler: Arc<dyn ClaimHandler>,
    backoff: BackoffPolicy,
    consume_retry_delay: Duration,
    scope: Mutex<Option<CancellationToken>>,
    lifecycle: Lifecycle,
}

impl Consumer {
    pub fn new(
        connector: Arc<dyn GroupConnector>,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let lifecycle = Lifecycle::new();
        Self {
            connector,
            topics,
            claim_handler: Arc::new(MessageClaimHandler::new(handler, lifecycle.clone())),
            backoff: BackoffPolicy::default(),
            consume_retry_delay: CONSUME_RETRY_DELAY,
            scope: Mutex::new(None),
            lifecycle,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_consume_retry_delay(mut self, delay: Duration) -> Self {
        self.consume_retry_delay = delay;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Run until `cancel` fires or [`Consumer::close`] is called. A clean stop
    /// is reported as [`ConsumerError::Cancelled`].
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        let scope = {
            let mut current = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_some() {
                return Err(ConsumerError::AlreadyRunning);
            }
            let scope = cancel.child_token();
            *current = Some(scope.clone());
            scope
        };

        self.lifecycle.mark_starting();
        let result = self.run(&scope).await;

        self.scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.lifecycle.mark_stopped();
        info!("consumer stopped");

        result
    }

    /// Cancel a running `start`. Does nothing when not running.
    pub fn close(&self) {
        let scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scope) = scope.as_ref() {
            scope.cancel();
        }
    }

    async fn run(&self, scope: &CancellationToken) -> Result<(), ConsumerError> {
        let connector = &self.connector;
        let group = match connect_with_retry(scope, &self.backoff, "kafka consumer group", move || {
            connector.connect()
        })
        .await
        {
            Ok(group) => group,
            Err(cancelled) => {
                self.lifecycle.mark_shutting_down();
                return Err(cancelled.into());
            }
        };

        let watcher = tokio::spawn(watch_errors(group.errors(), scope.clone()));
        info!(topics = ?self.topics, "consuming");

        loop {
            let result = group
                .consume(scope, &self.topics, self.claim_handler.clone())
                .await;
            if scope.is_cancelled() {
                break;
            }

            if let Err(e) = result {
                metrics::counter!(CONSUME_RETRIES).increment(1);
                error!(
                    error = %e,
                    retry_in_ms = self.consume_retry_delay.as_millis() as u64,
                    "consume failed, retrying"
                );
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = tokio::time::sleep(self.consume_retry_delay) => {}
                }
            }
        }

        self.lifecycle.mark_shutting_down();
        info!("shutting down consumer");
        scope.cancel();

        if let Err(e) = watcher.await {
            error!("error watcher task failed: {}", e);
        }
        if let Err(e) = group.close().await {
            warn!(error = %e, "failed to close consumer group");
        }

        Err(ConsumerError::Cancelled)
    }
}

/// Log every asynchronous group error until the stream ends or `scope` is cancelled.
pub async fn watch_errors(
    errors: Option<mpsc::UnboundedReceiver<GroupError>>,
    scope: CancellationToken,
) {
    let Some(mut errors) = errors else {
        return;
    };

    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            error = errors.recv() => match error {
                Some(e) => {
                    metrics::counter!(GROUP_ERRORS).increment(1);
                    error!(error = %e, "kafka consumer group error");
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::test::{MemoryConnector, MemoryGroup};

    const TOPIC: &str = "vk";

    /// Fails payloads equal to `b"bad"`, counts everything.
    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _cancel: &CancellationToken, payload: &[u8]) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if payload == b"bad" {
                anyhow::bail!("rejected");
            }
            Ok(())
        }
    }

    fn consumer_for(
        connector: Arc<MemoryConnector>,
        handler: Arc<CountingHandler>,
    ) -> Arc<Consumer> {
        Arc::new(
            Consumer::new(connector, vec![TOPIC.to_owned()], handler)
                .with_backoff(BackoffPolicy::default())
                .with_consume_retry_delay(CONSUME_RETRY_DELAY),
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_marks_successful_messages_and_stops_on_cancel() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        group.push(0, &[b"a", b"bad", b"c"]);
        group.push(1, &[b"d"]);
        let connector = Arc::new(MemoryConnector::new(group.clone(), 0));
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer_for(connector, handler.clone());
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 4).await;
        assert_eq!(consumer.lifecycle().state(), LifecycleState::Running);

        cancel.cancel();
        let result = running.await.unwrap();

        assert_eq!(result, Err(ConsumerError::Cancelled));
        let mut marked = group.marked();
        marked.sort();
        assert_eq!(marked, vec![(0, 0), (0, 2), (1, 0)]);
        assert!(group.is_closed());
        assert_eq!(consumer.lifecycle().state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        group.push(0, &[b"a"]);
        let connector = Arc::new(MemoryConnector::new(group.clone(), 3));
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer_for(connector.clone(), handler.clone());
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 1).await;
        // 500ms + 1s + 2s of backoff before the fourth attempt succeeds
        assert!(Instant::now() - start >= Duration::from_millis(3500));
        assert_eq!(connector.attempts(), 4);

        consumer.close();
        assert_eq!(running.await.unwrap(), Err(ConsumerError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_connecting() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        let connector = Arc::new(MemoryConnector::new(group.clone(), usize::MAX));
        let consumer = consumer_for(connector, Arc::new(CountingHandler::default()));
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(consumer.lifecycle().state(), LifecycleState::Starting);
        let cancelled_at = Instant::now();
        cancel.cancel();

        assert_eq!(running.await.unwrap(), Err(ConsumerError::Cancelled));
        assert!(Instant::now() - cancelled_at < Duration::from_secs(30));
        // never connected, so there is nothing to close
        assert!(!group.is_closed());
        assert_eq!(consumer.lifecycle().state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_failures_use_fixed_delay() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        group.fail_next_consumes(3);
        group.push(0, &[b"a"]);
        let connector = Arc::new(MemoryConnector::new(group.clone(), 0));
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer_for(connector, handler.clone());
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 1).await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));
        assert_eq!(group.consume_calls(), 4);

        cancel.cancel();
        assert_eq!(running.await.unwrap(), Err(ConsumerError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalance_starts_a_new_generation() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        group.push(0, &[b"a"]);
        let connector = Arc::new(MemoryConnector::new(group.clone(), 0));
        let handler = Arc::new(CountingHandler::default());
        let consumer = consumer_for(connector, handler.clone());
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });

        wait_for(|| handler.handled.load(Ordering::SeqCst) == 1).await;
        group.push(0, &[b"b"]);
        group.rebalance();
        wait_for(|| handler.handled.load(Ordering::SeqCst) == 2).await;

        assert_eq!(group.consume_calls(), 2);
        assert_eq!(group.marked(), vec![(0, 0), (0, 1)]);

        cancel.cancel();
        assert_eq!(running.await.unwrap(), Err(ConsumerError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        let connector = Arc::new(MemoryConnector::new(group, 0));
        let consumer = consumer_for(connector, Arc::new(CountingHandler::default()));
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            consumer.start(&cancel).await,
            Err(ConsumerError::AlreadyRunning)
        );

        consumer.close();
        consumer.close();
        assert_eq!(running.await.unwrap(), Err(ConsumerError::Cancelled));

        // the scope is released, so a fresh start is allowed again
        let restart = tokio::spawn({
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            async move { consumer.start(&cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(restart.await.unwrap(), Err(ConsumerError::Cancelled));
    }

    #[test]
    fn test_close_without_start_is_a_no_op() {
        let group = Arc::new(MemoryGroup::new(TOPIC));
        let connector = Arc::new(MemoryConnector::new(group, 0));
        let consumer = consumer_for(connector, Arc::new(CountingHandler::default()));

        consumer.close();
        assert_eq!(consumer.lifecycle().state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_watch_errors_drains_until_stream_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(GroupError::Rebalance("one".to_owned())).unwrap();
        tx.send(GroupError::Closed).unwrap();
        drop(tx);

        // returns on its own once the stream is closed
        watch_errors(Some(rx), CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_watch_errors_stops_on_cancel() {
        let (_tx, rx) = mpsc::unbounded_channel::<GroupError>();
        let scope = CancellationToken::new();
        scope.cancel();

        watch_errors(Some(rx), scope).await;
        watch_errors(None, CancellationToken::new()).await;
    }
}
