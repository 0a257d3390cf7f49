use std::time::Duration;

use async_trait::async_trait;
use common_kafka::group::MessageHandler;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SendError;
use crate::types::{SendMessageRequest, VkApiResponse};

pub const API_VERSION: &str = "5.199";
const SEND_METHOD: &str = "messages.send";
const MAX_ERROR_BODY: usize = 512;
const VK_REQUESTS: &str = "vk_send_requests_total";

pub fn build_http_client(request_timeout: Duration) -> reqwest::Result<Client> {
    reqwest::Client::builder()
        .user_agent("vk-sender")
        .timeout(request_timeout)
        .build()
}

/// Delivers [`SendMessageRequest`]s through the VK `messages.send` method.
/// Each request is attempted exactly once.
pub struct VkMessageSender {
    client: Client,
    token: String,
    endpoint: String,
}

impl VkMessageSender {
    pub fn new(token: &str, api_base: &str, request_timeout: Duration) -> Result<Self, SendError> {
        let client = build_http_client(request_timeout).map_err(SendError::Client)?;

        Ok(Self {
            client,
            token: token.to_owned(),
            endpoint: format!("{}/{}", api_base.trim_end_matches('/'), SEND_METHOD),
        })
    }

    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: &SendMessageRequest,
    ) -> Result<(), SendError> {
        let result = self.exchange(cancel, request).await;

        let outcome = match &result {
            Ok(()) => "success",
            Err(SendError::Api { .. }) => "api_error",
            Err(SendError::Status { .. }) => "bad_status",
            Err(SendError::Cancelled) => "cancelled",
            Err(_) => "failure",
        };
        metrics::counter!(VK_REQUESTS, "outcome" => outcome).increment(1);

        if result.is_ok() {
            info!(peer_id = request.peer_id, "message sent");
        }
        result
    }

    async fn exchange(
        &self,
        cancel: &CancellationToken,
        request: &SendMessageRequest,
    ) -> Result<(), SendError> {
        let peer_id = request.peer_id.to_string();
        let random_id = random_id().to_string();
        let form = [
            ("access_token", self.token.as_str()),
            ("v", API_VERSION),
            ("peer_id", peer_id.as_str()),
            ("message", request.message.as_str()),
            ("random_id", random_id.as_str()),
        ];

        let call = async {
            let response = self
                .client
                .post(&self.endpoint)
                .form(&form)
                .send()
                .await
                .map_err(SendError::Transport)?;
            let status = response.status();
            let body = response.text().await.map_err(SendError::Transport)?;
            Ok::<_, SendError>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            result = call => result?,
        };

        if status.as_u16() >= 300 {
            return Err(SendError::Status {
                status,
                body: truncate(&body),
            });
        }

        let parsed: VkApiResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(source) => {
                return Err(SendError::Parse {
                    source,
                    body: truncate(&body),
                })
            }
        };

        if let Some(error) = parsed.error {
            return Err(SendError::Api {
                code: error.error_code,
                message: error.error_msg,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for VkMessageSender {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> anyhow::Result<()> {
        let request: SendMessageRequest =
            serde_json::from_slice(payload).map_err(SendError::Decode)?;

        self.send(cancel, &request).await?;
        Ok(())
    }
}

/// Deduplication id for `messages.send`, in `[0, 2^31 - 1]`.
pub fn random_id() -> i32 {
    let mut bytes = [0u8; 4];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => (u32::from_le_bytes(bytes) & 0x7fff_ffff) as i32,
        Err(e) => {
            warn!("os rng unavailable, using fixed random_id: {}", e);
            1
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}
