use envconfig::Envconfig;

pub use common_kafka::config::{EnvMsDuration, KafkaConfig, NonEmptyString};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Comma separated list of topics
    #[envconfig(from = "KAFKA_TOPIC_NAME_VK_REQUEST_MESSAGE")]
    pub kafka_topic: NonEmptyString,

    #[envconfig(from = "KAFKA_GROUP_ID_VK_SENDER")]
    pub kafka_group_id: NonEmptyString,

    #[envconfig(from = "VK_TOKEN")]
    pub vk_token: NonEmptyString,

    #[envconfig(from = "VK_API_BASE", default = "https://api.vk.com/method")]
    pub vk_api_base: String,

    #[envconfig(from = "VK_REQUEST_TIMEOUT_MS", default = "10000")]
    pub vk_request_timeout: EnvMsDuration,

    #[envconfig(from = "VK_SENDER_SERVER_HOST", default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "VK_SENDER_SERVER_PORT")]
    pub bind_port: u16,
}

impl Config {
    pub fn topics(&self) -> Vec<String> {
        self.kafka_topic
            .as_str()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}
