use std::sync::Arc;

use anyhow::Context;
use common_kafka::consumer::Consumer;
use common_kafka::kafka_group::KafkaGroupConnector;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use vk_sender::config::Config;
use vk_sender::router::{router, setup_metrics_recorder, setup_metrics_routes};
use vk_sender::sender::VkMessageSender;

fn setup_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("rdkafka=warn".parse()?);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let log_layer = if json {
        fmt::layer().json().with_filter(filter).boxed()
    } else {
        fmt::layer().with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("Starting vk sender...");

    let config = Config::init_from_env().context("invalid configuration")?;
    let topics = config.topics();
    info!(
        topics = ?topics,
        group_id = config.kafka_group_id.as_str(),
        brokers = config.kafka.kafka_hosts.as_str(),
        sasl = config.kafka.kafka_sasl_enabled,
        "Configuration loaded"
    );

    let sender = Arc::new(VkMessageSender::new(
        config.vk_token.as_str(),
        &config.vk_api_base,
        config.vk_request_timeout.0,
    )?);
    let connector = Arc::new(KafkaGroupConnector::new(
        config.kafka.clone(),
        config.kafka_group_id.as_str(),
    ));
    let consumer = Consumer::new(connector, topics, sender);

    // Health and metrics server
    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let app = setup_metrics_routes(router(consumer.lifecycle()), setup_metrics_recorder()?);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("health server failed: {}", e);
        }
    });

    // Shutdown signal
    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
            cancel.cancel();
        }
    });

    if let Err(e) = consumer.start(&cancel).await {
        if !e.is_cancelled() {
            return Err(e.into());
        }
    }

    info!("vk sender shut down");
    Ok(())
}
