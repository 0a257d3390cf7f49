use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::KafkaConfig;
use common_kafka::consumer::Consumer;
use common_kafka::error::ConsumerError;
use common_kafka::group::MessageHandler;
use common_kafka::kafka_group::KafkaGroupConnector;
use common_kafka::lifecycle::LifecycleState;
use common_kafka::test::create_mock_kafka;
use rdkafka::producer::FutureRecord;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "vk-request-message";

#[derive(Default)]
struct CollectingHandler {
    payloads: Mutex<Vec<String>>,
}

impl CollectingHandler {
    fn collected(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, _cancel: &CancellationToken, payload: &[u8]) -> anyhow::Result<()> {
        let payload = String::from_utf8(payload.to_vec())?;
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumes_every_record_from_mock_cluster() {
    let (cluster, producer) = create_mock_kafka();
    cluster.create_topic(TOPIC, 2, 1).unwrap();

    let mut expected = Vec::new();
    for i in 0..6 {
        let payload = format!(r#"{{"peer_id":{i},"message":"hello {i}"}}"#);
        producer
            .send(
                FutureRecord::<(), str>::to(TOPIC)
                    .partition(i % 2)
                    .payload(payload.as_str()),
                Duration::from_secs(5),
            )
            .await
            .expect("failed to produce to mock cluster");
        expected.push(payload);
    }

    let connector = Arc::new(KafkaGroupConnector::new(
        KafkaConfig::plaintext(&cluster.bootstrap_servers()),
        "vk-sender-test",
    ));
    let handler = Arc::new(CollectingHandler::default());
    let consumer = Arc::new(Consumer::new(
        connector,
        vec![TOPIC.to_owned()],
        handler.clone(),
    ));
    let cancel = CancellationToken::new();

    let running = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        async move { consumer.start(&cancel).await }
    });

    tokio::time::timeout(Duration::from_secs(30), async {
        while handler.collected().len() < expected.len() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("records were not consumed in time");
    assert_eq!(consumer.lifecycle().state(), LifecycleState::Running);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(15), running)
        .await
        .expect("consumer did not stop in time")
        .unwrap();
    assert_eq!(result, Err(ConsumerError::Cancelled));
    assert_eq!(consumer.lifecycle().state(), LifecycleState::Stopped);

    let mut collected = handler.collected();
    collected.sort();
    expected.sort();
    assert_eq!(collected, expected);
}

#[tokio::test]
async fn test_unreachable_brokers_retry_until_cancelled() {
    let mut config = KafkaConfig::plaintext("127.0.0.1:1");
    config.kafka_dial_timeout.0 = Duration::from_millis(200);
    let connector = Arc::new(KafkaGroupConnector::new(config, "vk-sender-test"));
    let consumer = Arc::new(Consumer::new(
        connector,
        vec![TOPIC.to_owned()],
        Arc::new(CollectingHandler::default()),
    ));
    let cancel = CancellationToken::new();

    let running = tokio::spawn({
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        async move { consumer.start(&cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(consumer.lifecycle().state(), LifecycleState::Starting);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("consumer did not stop in time")
        .unwrap();
    assert_eq!(result, Err(ConsumerError::Cancelled));
}
