use std::sync::Arc;
use std::time::Duration;

use common_kafka::consumer::Consumer;
use common_kafka::error::ConsumerError;
use common_kafka::test::{MemoryConnector, MemoryGroup};
use mockito::Matcher;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vk_sender::sender::VkMessageSender;

const TOPIC: &str = "vk-request-message";

fn start(
    group: &Arc<MemoryGroup>,
    server: &mockito::ServerGuard,
    cancel: &CancellationToken,
) -> JoinHandle<Result<(), ConsumerError>> {
    let sender =
        Arc::new(VkMessageSender::new("vk-token", &server.url(), Duration::from_secs(5)).unwrap());
    let connector = Arc::new(MemoryConnector::new(group.clone(), 0));
    let consumer = Consumer::new(connector, vec![TOPIC.to_owned()], sender);
    let cancel = cancel.clone();

    tokio::spawn(async move { consumer.start(&cancel).await })
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn stop(cancel: CancellationToken, running: JoinHandle<Result<(), ConsumerError>>) {
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("consumer did not stop")
        .unwrap();
    assert_eq!(result, Err(ConsumerError::Cancelled));
}

#[tokio::test]
async fn test_delivered_message_is_committed() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/messages.send")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("peer_id".into(), "123".into()),
            Matcher::UrlEncoded("message".into(), "hi".into()),
        ]))
        .with_body(r#"{"response":456}"#)
        .create_async()
        .await;

    let group = Arc::new(MemoryGroup::new(TOPIC));
    group.push(0, &[br#"{"peer_id":123,"message":"hi"}"#]);
    let cancel = CancellationToken::new();
    let running = start(&group, &server, &cancel);

    eventually(|| group.marked() == vec![(0, 0)]).await;
    stop(cancel, running).await;

    mock.assert_async().await;
    assert!(group.is_closed());
}

#[tokio::test]
async fn test_api_error_is_not_committed() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", "/messages.send")
        .match_body(Matcher::UrlEncoded("peer_id".into(), "123".into()))
        .with_body(r#"{"error":{"error_code":7,"error_msg":"Permission to perform this action is denied"}}"#)
        .create_async()
        .await;
    let succeeding = server
        .mock("POST", "/messages.send")
        .match_body(Matcher::UrlEncoded("peer_id".into(), "456".into()))
        .with_body(r#"{"response":1}"#)
        .create_async()
        .await;

    let group = Arc::new(MemoryGroup::new(TOPIC));
    group.push(
        0,
        &[
            br#"{"peer_id":123,"message":"hi"}"#,
            br#"{"peer_id":456,"message":"hi"}"#,
        ],
    );
    let cancel = CancellationToken::new();
    let running = start(&group, &server, &cancel);

    // the second message is handled after the first one failed
    eventually(|| group.marked() == vec![(0, 1)]).await;
    stop(cancel, running).await;

    failing.assert_async().await;
    succeeding.assert_async().await;
    assert_eq!(group.marked(), vec![(0, 1)]);
}

#[tokio::test]
async fn test_malformed_payload_is_skipped_without_a_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/messages.send")
        .match_body(Matcher::UrlEncoded("peer_id".into(), "123".into()))
        .with_body(r#"{"response":456}"#)
        .expect(1)
        .create_async()
        .await;

    let group = Arc::new(MemoryGroup::new(TOPIC));
    group.push(
        0,
        &[b"definitely not json", br#"{"peer_id":123,"message":"hi"}"#],
    );
    let cancel = CancellationToken::new();
    let running = start(&group, &server, &cancel);

    eventually(|| group.marked() == vec![(0, 1)]).await;
    stop(cancel, running).await;

    mock.assert_async().await;
}
