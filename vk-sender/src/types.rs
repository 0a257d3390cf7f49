use serde::{Deserialize, Serialize};

/// A request to deliver `message` to the VK conversation `peer_id`, as
/// published on the request topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub peer_id: i64,
    pub message: String,
}

/// Envelope of every VK API response: either `response` or `error` is set.
#[derive(Debug, Deserialize)]
pub struct VkApiResponse {
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<VkApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VkApiError {
    pub error_code: i64,
    pub error_msg: String,
}
