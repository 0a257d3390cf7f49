use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS_VALUE")]
    pub kafka_hosts: NonEmptyString,

    #[envconfig(from = "KAFKA_CLIENT_ID", default = "vk-sender")]
    pub kafka_client_id: String,

    // Broker protocol version used when the broker does not answer ApiVersion requests
    #[envconfig(from = "KAFKA_PROTOCOL_VERSION", default = "2.8.0")]
    pub kafka_protocol_version: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_SASL_ENABLED", default = "true")]
    pub kafka_sasl_enabled: bool,

    #[envconfig(from = "KAFKA_SASL_MECHANISM", default = "SCRAM-SHA-512")]
    pub kafka_sasl_mechanism: String,

    #[envconfig(from = "KAFKA_SASL_USERNAME", default = "")]
    pub kafka_sasl_username: String,

    #[envconfig(from = "KAFKA_SASL_PASSWORD", default = "")]
    pub kafka_sasl_password: String,

    // earliest, latest
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "15000")]
    pub kafka_session_timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_HEARTBEAT_INTERVAL_MS", default = "3000")]
    pub kafka_heartbeat_interval: EnvMsDuration,

    // Backoff after a failed fetch from a partition leader
    #[envconfig(from = "KAFKA_FETCH_RETRY_BACKOFF_MS", default = "2000")]
    pub kafka_fetch_retry_backoff: EnvMsDuration,

    #[envconfig(from = "KAFKA_METADATA_RETRY_BACKOFF_MS", default = "2000")]
    pub kafka_metadata_retry_backoff: EnvMsDuration,

    #[envconfig(from = "KAFKA_DIAL_TIMEOUT_MS", default = "5000")]
    pub kafka_dial_timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_SOCKET_TIMEOUT_MS", default = "5000")]
    pub kafka_socket_timeout: EnvMsDuration,

    // Interval between background commits of stored offsets
    #[envconfig(from = "KAFKA_AUTO_COMMIT_INTERVAL_MS", default = "1000")]
    pub kafka_auto_commit_interval: EnvMsDuration,
}

impl KafkaConfig {
    /// A plaintext, unauthenticated configuration for the given brokers.
    /// Mostly useful for local development and tests against a mock cluster.
    pub fn plaintext(hosts: &str) -> Self {
        Self {
            kafka_hosts: NonEmptyString(hosts.to_owned()),
            kafka_client_id: "vk-sender".to_owned(),
            kafka_protocol_version: "2.8.0".to_owned(),
            kafka_tls: false,
            kafka_sasl_enabled: false,
            kafka_sasl_mechanism: "SCRAM-SHA-512".to_owned(),
            kafka_sasl_username: String::new(),
            kafka_sasl_password: String::new(),
            kafka_consumer_offset_reset: "earliest".to_owned(),
            kafka_session_timeout: EnvMsDuration(time::Duration::from_secs(15)),
            kafka_heartbeat_interval: EnvMsDuration(time::Duration::from_secs(3)),
            kafka_fetch_retry_backoff: EnvMsDuration(time::Duration::from_secs(2)),
            kafka_metadata_retry_backoff: EnvMsDuration(time::Duration::from_secs(2)),
            kafka_dial_timeout: EnvMsDuration(time::Duration::from_secs(5)),
            kafka_socket_timeout: EnvMsDuration(time::Duration::from_secs(5)),
            kafka_auto_commit_interval: EnvMsDuration(time::Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

impl EnvMsDuration {
    pub fn as_millis_string(&self) -> String {
        self.0.as_millis().to_string()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A string that must be present and non-empty, used for required settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl std::fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "value must not be empty")
    }
}

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(trimmed.to_owned()))
        }
    }
}
