//! MAIA message injection utility
//!
//! Publishes one chat message to the bus, standing in for the chat front-end.
//!
//! ## Usage
//!
//! ```bash
//! # What a user would type
//! inject-message --chat-id 441992716 --text "Schedule a meeting tomorrow"
//!
//! # Straight to an agent, skipping the dispatcher
//! inject-message --topic agent.WeatherAgent.request --chat-id 1 \
//!   --text "Weather in Rome today"
//!
//! # Against a remote broker
//! inject-message --broker-host rabbit.internal --chat-id 1 --text "hi"
//! ```

use clap::Parser;
use maia::config::MaiaConfig;
use maia::observability::init_default_logging;
use maia::protocol::{ChatMessage, TopicBuilder};
use maia::transport::{AmqpBroker, Publisher};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "inject-message",
    about = "Publish a test chat message to the MAIA bus"
)]
struct Args {
    /// Topic to publish to
    #[arg(long, default_value = "user.message.new")]
    topic: String,

    #[arg(long)]
    chat_id: i64,

    #[arg(long)]
    text: String,

    /// Configuration file for broker settings
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured broker host
    #[arg(long, env = "MAIA_BROKER_HOST")]
    broker_host: Option<String>,

    /// Override the configured broker port
    #[arg(long)]
    broker_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = init_default_logging();

    let mut config = match &args.config {
        Some(path) => MaiaConfig::load_from_file(path),
        None => MaiaConfig::from_toml_str(""),
    }
    .unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        process::exit(1);
    });
    if let Some(host) = args.broker_host {
        config.broker.host = host;
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }

    let publisher = Publisher::new(Arc::new(AmqpBroker::new()), config.broker_config());

    // Agent topics take a request payload rather than plain chat text
    let payload = if args.topic.starts_with("agent.") {
        json!({
            "chat_id": args.chat_id,
            "original_request": args.text,
            "context_to_forward": args.text,
        })
    } else {
        serde_json::to_value(ChatMessage::new(Some(args.chat_id), args.text))
            .unwrap_or_else(|e| {
                error!("Failed to encode message: {}", e);
                process::exit(1);
            })
    };

    let published = publisher.publish(&args.topic, &payload).await;
    publisher.disconnect().await;

    if !published {
        error!("Publish to '{}' failed", args.topic);
        process::exit(1);
    }
    info!("Published to '{}': {}", args.topic, payload);
    if args.topic != TopicBuilder::user_message_new() && !args.topic.starts_with("agent.") {
        info!("Note: the dispatcher only listens on {}", TopicBuilder::user_message_new());
    }
}
