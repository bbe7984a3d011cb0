//! CLI for RelayMQ
//!
//! Subcommands:
//! - `serve`: open the brokers, default endpoints and routes, then run the ingress
//! - `submit`: send one message to a running ingress (useful for smoke tests)

use std::sync::Arc;

use clap::Parser;
use relaymq::broker::{EmbeddedLogBroker, InMemoryQueueBroker, Message};
use relaymq::config::{Settings, load_config};
use relaymq::consumer::handler_fn;
use relaymq::endpoint::{EndpointConfig, EndpointManager};
use relaymq::routing::{RoutingContext, RoutingPipeline};
use relaymq::stats::StatsCollector;
use relaymq::transport::{Ingress, start_websocket_server};
use relaymq::utils::error::{Error, HandlerError, Result};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "relaymq")]
enum Command {
    /// Run the gateway until interrupted
    Serve,
    /// Submit one message to the ingress and print the reply
    Submit {
        /// WebSocket ingress URL (default: ws://127.0.0.1:8080)
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    match cmd {
        Command::Serve => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Submit { url, payload, key } => {
            relaymq::utils::logging::init("info");
            if let Err(e) = run_submit(&url, payload, key).await {
                error!("Submit failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server() -> Result<()> {
    let settings = load_config()?;
    relaymq::utils::logging::init(&settings.logging.level);

    let log_broker = Arc::new(EmbeddedLogBroker::open(&settings.log_broker)?);
    let queue_broker = Arc::new(InMemoryQueueBroker::connect(&settings.queue_broker)?);
    let endpoints = Arc::new(EndpointManager::new(log_broker));

    // without the default endpoints there is nothing to serve
    let defaults = endpoints.open_defaults(&settings).await?;
    start_default_consumers(&defaults)?;
    let replay = defaults.batch_reader.clone().drain(handler_fn(log_message));

    let ctx = RoutingContext {
        endpoints: endpoints.clone(),
        queue_broker: queue_broker.clone(),
        endpoint_config: EndpointConfig::from_settings(&settings),
        ack_timeout: settings.consumer.ack_timeout(),
    };
    let pipeline = Arc::new(RoutingPipeline::start(&settings.routes, &ctx).await);
    for (id, state) in pipeline.states() {
        info!("Route {} is {:?}", id, state);
    }

    let stats = StatsCollector::new(endpoints.clone())
        .with_queue_broker(queue_broker)
        .with_pipeline(pipeline.clone());
    let ingress = Ingress {
        producer: defaults.producer.clone(),
        batch_producer: defaults.batch_producer.clone(),
        pipeline: pipeline.clone(),
        stats,
    };

    run_until_interrupted(&settings, ingress).await?;

    let drain_timeout = settings.lifecycle.drain_timeout();
    if let Some(summary) = replay.stop(drain_timeout).await {
        info!("Replay of '{}' delivered {} messages", defaults.batch_reader.topic(), summary.delivered);
    }
    let routes_abandoned = pipeline.stop(drain_timeout).await;
    let report = endpoints.shutdown(drain_timeout).await;
    info!(
        "Shutdown closed {} endpoints, abandoned {} sends and {} routed messages",
        report.closed, report.abandoned, routes_abandoned
    );

    if report.abandoned + routes_abandoned > 0 {
        return Err(Error::DrainTimeout(drain_timeout));
    }
    Ok(())
}

fn start_default_consumers(defaults: &relaymq::endpoint::DefaultEndpoints) -> Result<()> {
    defaults.consumer.consume(handler_fn(log_message))?;
    defaults.batch_consumer.consume(handler_fn(log_message))?;
    Ok(())
}

async fn log_message(message: Message) -> std::result::Result<(), HandlerError> {
    info!(
        "Received {} on '{}': {}",
        message.id(),
        message.topic(),
        message.payload_str()
    );
    Ok(())
}

async fn run_until_interrupted(settings: &Settings, ingress: Ingress) -> Result<()> {
    if !settings.ingress.enabled {
        info!("Ingress disabled; waiting for shutdown signal");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received. Draining.");
        return Ok(());
    }

    let addr = format!("{}:{}", settings.ingress.host, settings.ingress.port);
    tokio::select! {
        result = start_websocket_server(&addr, ingress) => {
            match result {
                Ok(()) => warn!("Ingress exited unexpectedly."),
                Err(e) => return Err(e.into()),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Draining.");
        }
    }
    Ok(())
}

async fn run_submit(
    url: &str,
    payload: String,
    key: Option<String>,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use relaymq::transport::ClientMessage;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let request = ClientMessage::Submit {
        payload,
        key,
        properties: Default::default(),
        delay_ms: None,
        compression: None,
    };
    ws_stream
        .send(WsMessage::Text(serde_json::to_string(&request)?.into()))
        .await?;

    match ws_stream.next().await {
        Some(Ok(WsMessage::Text(reply))) => println!("{reply}"),
        Some(Ok(other)) => println!("Unexpected frame: {other:?}"),
        Some(Err(e)) => return Err(e.into()),
        None => return Err("connection closed before a reply".into()),
    }
    ws_stream.close(None).await?;
    Ok(())
}
