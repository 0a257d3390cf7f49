use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("failed to decode message payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to build vk http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("vk request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("vk responded with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to parse vk response: {source}")]
    Parse {
        source: serde_json::Error,
        body: String,
    },
    #[error("vk api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("vk request cancelled")]
    Cancelled,
}
