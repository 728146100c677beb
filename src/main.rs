//! MAIA process entry point
//!
//! One binary runs any bus component: the dispatcher, the log sink or a named
//! LLM-backed agent. Signal handlers are installed before anything touches
//! the broker; every mode then releases its subscription queues on shutdown
//! and after a failed start.

use clap::{Parser, Subcommand};
use maia::agent::{AgentWorker, LlmAgentHandler};
use maia::bus_logger::BusLogger;
use maia::config::{ClassifierSection, MaiaConfig};
use maia::dispatch::prompts::agent_prompt;
use maia::dispatch::{Dispatcher, LlmClassifier};
use maia::lifecycle::{run_until_shutdown, ShutdownSignals};
use maia::llm::provider::LlmProvider;
use maia::llm::providers::openai::{OpenAiConfig, OpenAiProvider};
use maia::log_sink::LogSink;
use maia::observability::{init_default_logging, init_logging, LogFormat};
use maia::store::InMemoryConversationStore;
use maia::transport::{AmqpBroker, Broker, Consumer, Publisher};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// MAIA bus components
#[derive(Parser)]
#[command(name = "maia")]
#[command(about = "MAIA multi-agent assistant: dispatcher, log sink and agent workers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging (ignored when LOG_LEVEL or RUST_LOG is set)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route user.message.new to agents
    Dispatcher,
    /// Collect every component's bus log records
    LogSink,
    /// Serve agent.<NAME>.request with an LLM
    Agent {
        #[arg(long)]
        name: String,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _log_guard = if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
        let log_dir = std::env::var("LOG_DIR").ok();
        init_logging(Level::DEBUG, format, false, log_dir.as_deref())
    } else {
        init_default_logging()
    };

    info!("Starting MAIA v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Dispatcher => run_dispatcher(config).await,
        Commands::LogSink => run_log_sink(config).await,
        Commands::Agent { name } => run_agent(config, name).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<MaiaConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MaiaConfig::load_from_file(path)?);
    }

    for candidate in ["maia.toml", "config/maia.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MaiaConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(MaiaConfig::from_toml_str("")?)
}

/// Publisher, consumer and a bus logger for one component, each on its own
/// broker connection
struct BusHandles {
    publisher: Arc<Publisher>,
    consumer: Arc<Consumer>,
    logger: BusLogger,
}

impl BusHandles {
    fn new(config: &MaiaConfig, sender: &str) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new());
        let publisher = Arc::new(Publisher::new(broker.clone(), config.broker_config()));
        let consumer = Arc::new(Consumer::new(broker, config.broker_config()));
        let logger = BusLogger::new(sender, publisher.clone());
        Self {
            publisher,
            consumer,
            logger,
        }
    }
}

fn create_llm_provider(
    config: &MaiaConfig,
) -> Result<Arc<dyn LlmProvider>, Box<dyn std::error::Error>> {
    let section: &ClassifierSection = &config.classifier;
    match section.provider.as_str() {
        "openai" => {
            let api_key = config.get_classifier_api_key()?;
            let provider = OpenAiProvider::new(OpenAiConfig::from_section(section, api_key))?;
            Ok(Arc::new(provider))
        }
        other => Err(format!("Unsupported LLM provider: {other}").into()),
    }
}

async fn run_dispatcher(config: MaiaConfig) -> CliResult {
    let signals = ShutdownSignals::register()?;
    let bus = BusHandles::new(&config, "dispatcher");
    let provider = create_llm_provider(&config)?;
    let classifier = Arc::new(LlmClassifier::new(provider, &config.classifier));

    let dispatcher = Arc::new(
        Dispatcher::new(
            bus.consumer.clone(),
            bus.publisher.clone(),
            classifier,
            bus.logger.clone(),
            &config.dispatcher,
        )
        .with_store(Arc::new(InMemoryConversationStore::new())),
    );

    run_until_shutdown(&dispatcher, signals.wait()).await?;
    Ok(())
}

async fn run_log_sink(config: MaiaConfig) -> CliResult {
    let signals = ShutdownSignals::register()?;
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new());
    let sink = LogSink::new(Arc::new(Consumer::new(broker, config.broker_config())));

    run_until_shutdown(&sink, signals.wait()).await?;
    Ok(())
}

async fn run_agent(config: MaiaConfig, name: String) -> CliResult {
    let signals = ShutdownSignals::register()?;
    let bus = BusHandles::new(&config, &name);
    let provider = create_llm_provider(&config)?;
    let system_prompt = config
        .agent
        .system_prompt
        .clone()
        .unwrap_or_else(|| agent_prompt(&name));
    let handler = Arc::new(LlmAgentHandler::new(
        provider,
        config.classifier.model.clone(),
        system_prompt,
    ));

    let worker = Arc::new(AgentWorker::new(
        name,
        bus.consumer.clone(),
        bus.publisher.clone(),
        handler,
        bus.logger.clone(),
    )?);

    run_until_shutdown(&worker, signals.wait()).await?;
    Ok(())
}

fn handle_config_command(config: &MaiaConfig, show: bool) -> CliResult {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
        println!("# broker: {}", config.broker.display_uri());
    }
    info!("Configuration validation complete");
    Ok(())
}
