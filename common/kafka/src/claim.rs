use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::group::{Claim, ClaimHandler, GroupSession, MessageHandler};
use crate::lifecycle::Lifecycle;

const MESSAGES_HANDLED: &str = "kafka_messages_handled_total";

/// Bridges claims from the group runtime to a [`MessageHandler`], marking each
/// record only after the handler succeeded.
pub struct MessageClaimHandler {
    handler: Arc<dyn MessageHandler>,
    lifecycle: Lifecycle,
}

impl MessageClaimHandler {
    pub fn new(handler: Arc<dyn MessageHandler>, lifecycle: Lifecycle) -> Self {
        Self { handler, lifecycle }
    }

    /// Run the handler once, turning a panic into an error.
    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<(), DispatchError> {
        match AssertUnwindSafe(self.handler.handle(cancel, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Failed(e)),
            Err(panic) => Err(DispatchError::Panic(panic_message(panic))),
        }
    }
}

#[async_trait]
impl ClaimHandler for MessageClaimHandler {
    async fn setup(&self, session: &dyn GroupSession) -> anyhow::Result<()> {
        info!(claims = ?session.claims(), "consumer group session started");
        self.lifecycle.mark_running();
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn GroupSession) -> anyhow::Result<()> {
        Ok(())
    }

    async fn consume_claim(&self, session: &dyn GroupSession, mut claim: Claim) -> anyhow::Result<()> {
        let cancel = session.cancellation();

        loop {
            // nothing new is dispatched once the session has ended
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = claim.next() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let result = self.dispatch(cancel, &record.payload).await;
            if result.is_err() && cancel.is_cancelled() {
                metrics::counter!(MESSAGES_HANDLED, "outcome" => "cancelled").increment(1);
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "message interrupted by session end"
                );
                break;
            }

            match result {
                Ok(()) => {
                    session.mark_message(&record);
                    metrics::counter!(MESSAGES_HANDLED, "outcome" => "success").increment(1);
                    debug!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "message handled"
                    );
                }
                Err(e) => {
                    let outcome = match e {
                        DispatchError::Panic(_) => "panic",
                        DispatchError::Failed(_) => "failure",
                    };
                    metrics::counter!(MESSAGES_HANDLED, "outcome" => outcome).increment(1);
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "failed to handle message"
                    );
                }
            }
        }

        Ok(())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "unknown panic payload".to_owned(),
        },
    }
}
