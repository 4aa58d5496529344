use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use eventhub::converter::headers;
use eventhub::{
    Connector, EventHubTemplate, InMemoryBroker, InboundAdapter, InboundMessage,
    JsonMessageConverter, KafkaConnector, Message, MessageHandler, OutboundHandler,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{Backend, Config};

mod config;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SampleEvent {
    sequence: u64,
    source: String,
}

struct LoggingHandler;

#[async_trait]
impl MessageHandler<SampleEvent> for LoggingHandler {
    async fn handle(&self, message: InboundMessage<SampleEvent>) -> anyhow::Result<()> {
        info!(
            sequence = message.message.payload.sequence,
            partition = message.message.header(headers::PARTITION_ID),
            offset = message.message.header(headers::OFFSET),
            "received sample event"
        );
        Ok(())
    }
}

fn setup_tracing(json: bool) {
    let log_layer = if json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

async fn connector(config: &Config) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match config.backend {
        Backend::Memory => Arc::new(InMemoryBroker::new(config.memory_partitions)),
        Backend::Kafka => Arc::new(
            KafkaConnector::from_config(&config.eventhub)
                .await
                .context("Failed to configure kafka connector")?,
        ),
    };
    Ok(connector)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    setup_tracing(config.log_json);
    info!("Configuration loaded: {:?}", config.backend);

    if let Some(port) = config.metrics_port {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install metrics exporter")?;
        info!("Metrics server listening on {}", metrics_addr);
    }

    let template = Arc::new(EventHubTemplate::from_config(
        connector(&config).await?,
        &config.eventhub,
    ));

    let inbound = InboundAdapter::new(
        template.clone(),
        config.entity_name.as_str(),
        config.consumer_group(),
        config.eventhub.eventhub_checkpoint_mode,
        Arc::new(JsonMessageConverter::<SampleEvent>::new()),
        Arc::new(LoggingHandler),
    );
    let key = inbound
        .start()
        .await
        .context("Failed to subscribe to entity")?;
    info!(entity = %key, "subscribed");

    let outbound = OutboundHandler::new(
        template.clone(),
        config.entity_name.as_str(),
        Arc::new(JsonMessageConverter::<SampleEvent>::new()),
    );
    let sequence = AtomicU64::new(0);
    let mut ticker = tokio::time::interval(config.send_interval());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let next = sequence.fetch_add(1, Ordering::SeqCst);
                let message = Message::new(SampleEvent {
                    sequence: next,
                    source: "eventhub-sample".to_string(),
                })
                .with_header(headers::PARTITION_KEY, format!("key-{}", next % 8));

                if let Err(e) = outbound.handle(&message).await {
                    error!(error = %e, "failed to send sample event");
                }
            }
        }
    }

    if let Err(e) = inbound.stop().await {
        error!(error = %e, "failed to unsubscribe");
    }
    template.close().await;
    info!("Shut down cleanly");
    Ok(())
}
