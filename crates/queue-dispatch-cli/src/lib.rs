//! # Queue Dispatch CLI
//!
//! Command-line interface for queue-dispatch.
//!
//! This module provides CLI commands for:
//! - Sending messages to producer queues
//! - Purging queues and reading their attributes
//! - Consuming a queue and printing message bodies
//! - Showing the resolved configuration
//! - Generating shell completions

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use queue_dispatch::{
    ConfigurationError, Engine, EngineConfig, EventKind, Handler, HandlerError, HandlerRegistry,
    OutboundMessage, QueueDescriptor, QueueError, QueueMode,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// queue-dispatch CLI - send to and consume from SQS queues
#[derive(Parser)]
#[command(name = "queue-dispatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send to and consume from SQS-compatible queues")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_DISPATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send one message to a producer queue
    Send {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Message body
        #[arg(short, long)]
        body: String,

        /// Entry id; a random id is used when omitted
        #[arg(long)]
        id: Option<String>,

        /// Message group id (FIFO queues)
        #[arg(long)]
        group_id: Option<String>,

        /// Deduplication id (FIFO queues)
        #[arg(long)]
        deduplication_id: Option<String>,

        /// Delivery delay in seconds (0-900)
        #[arg(long)]
        delay_seconds: Option<u32>,

        /// Parse the body as JSON and send its canonical form
        #[arg(long)]
        json: bool,
    },

    /// Delete every message in a queue
    Purge {
        /// Queue name
        #[arg(short, long)]
        queue: String,
    },

    /// Show queue attributes
    Attributes {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the approximate number of visible messages
    QueueSize {
        /// Queue name
        #[arg(short, long)]
        queue: String,
    },

    /// Consume a queue, printing each message body
    Consume {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show the resolved configuration with secrets masked
    Config {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Output format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// One `key=value` per line
    Text,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output failed: {message}")]
    Output { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<QueueError> for CliError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::ConfigurationError(inner) => Self::Configuration(inner),
            other => Self::Queue(other),
        }
    }
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 4,
            Self::Output { .. } => 5,
            Self::Io(_) => 5,
        }
    }
}

fn output_error(error: impl std::fmt::Display) -> CliError {
    CliError::Output {
        message: error.to_string(),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli.log_level, cli.json_logs)?;
    run(cli).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Completions { shell } => execute_completions_command(shell),
        Commands::Config { format } => {
            let config = load_configuration(cli.config.as_deref())?;
            execute_config_command(&config, format)
        }
        Commands::Send {
            queue,
            body,
            id,
            group_id,
            deduplication_id,
            delay_seconds,
            json,
        } => {
            let config = load_configuration(cli.config.as_deref())?;
            let mut message = build_message(id, body, json)?;
            if let Some(group_id) = group_id {
                message = message.with_group_id(group_id);
            }
            if let Some(deduplication_id) = deduplication_id {
                message = message.with_deduplication_id(deduplication_id);
            }
            if let Some(delay) = delay_seconds {
                message = message.with_delay_seconds(delay);
            }
            execute_send_command(config, &queue, message).await
        }
        Commands::Purge { queue } => {
            let engine = admin_engine(load_configuration(cli.config.as_deref())?)?;
            engine.purge_queue(&queue).await?;
            info!(queue = %queue, "Queue purged");
            Ok(())
        }
        Commands::Attributes { queue, format } => {
            let engine = admin_engine(load_configuration(cli.config.as_deref())?)?;
            let attributes = engine.get_queue_attributes(&queue).await?;
            print_attributes(&attributes.into_iter().collect(), format)
        }
        Commands::QueueSize { queue } => {
            let config = load_configuration(cli.config.as_deref())?;
            ensure_producer(&config, &queue)?;
            let engine = admin_engine(config)?;
            let size = engine.producer_queue_size(&queue).await?;
            println!("{}", size);
            Ok(())
        }
        Commands::Consume { queue, limit } => {
            let config = load_configuration(cli.config.as_deref())?;
            execute_consume_command(config, &queue, limit).await
        }
    }
}

// ============================================================================
// Logging and Configuration
// ============================================================================

/// Install the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` wins over `level` when set.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::InvalidArgument {
        arg: "--log-level".to_string(),
        message: e.to_string(),
    })
}

const CONFIG_FILE_STEM: &str = "queue-dispatch";
const CONFIG_EXTENSIONS: [&str; 4] = ["yaml", "yml", "toml", "json"];

/// Pick the configuration file to load
///
/// An explicit path always wins. Otherwise the first existing file among
/// `./config/queue-dispatch.*` and `<user config dir>/queue-dispatch/config.*`
/// is used. `None` means configuration comes from the environment only.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = CONFIG_EXTENSIONS
        .iter()
        .map(|ext| PathBuf::from("config").join(format!("{}.{}", CONFIG_FILE_STEM, ext)));
    let user = dirs::config_dir()
        .into_iter()
        .flat_map(|dir| {
            CONFIG_EXTENSIONS
                .iter()
                .map(move |ext| dir.join(CONFIG_FILE_STEM).join(format!("config.{}", ext)))
        });

    local.chain(user).find(|candidate| candidate.is_file())
}

/// Load and validate the engine configuration
pub fn load_configuration(explicit: Option<&Path>) -> Result<EngineConfig, CliError> {
    let path = resolve_config_path(explicit);
    match &path {
        Some(path) => info!(path = %path.display(), "Loading configuration"),
        None => info!("No configuration file found; using environment only"),
    }
    Ok(EngineConfig::load(path.as_deref())?)
}

/// Engine for one-off operations: no consumers, every queue reachable
fn admin_engine(mut config: EngineConfig) -> Result<Engine, CliError> {
    for queue in &mut config.queues {
        queue.mode = QueueMode::Producer;
    }
    Ok(Engine::from_config(config, HandlerRegistry::new())?)
}

fn ensure_producer(config: &EngineConfig, queue: &str) -> Result<(), CliError> {
    match config.queue(queue) {
        Some(descriptor) if descriptor.mode.produces() => Ok(()),
        _ => Err(ConfigurationError::ProducerNotFound {
            queue: queue.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Build the outbound message from command-line arguments
pub fn build_message(id: Option<String>, body: String, json: bool) -> Result<OutboundMessage, CliError> {
    let id = id.unwrap_or_else(|| queue_dispatch::MessageId::new().to_string());
    if json {
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| CliError::InvalidArgument {
                arg: "--body".to_string(),
                message: format!("not valid JSON: {}", e),
            })?;
        Ok(OutboundMessage::new(id, value))
    } else {
        Ok(OutboundMessage::new(id, body))
    }
}

async fn execute_send_command(
    config: EngineConfig,
    queue: &str,
    message: OutboundMessage,
) -> Result<(), CliError> {
    ensure_producer(&config, queue)?;
    let engine = admin_engine(config)?;

    for sent in engine.send(queue, [message]).await? {
        println!("{}", sent.message_id);
    }
    Ok(())
}

fn print_attributes(attributes: &BTreeMap<String, String>, format: OutputFormat) -> Result<(), CliError> {
    match format {
        OutputFormat::Text => {
            for (key, value) in attributes {
                println!("{}={}", key, value);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(attributes).map_err(output_error)?
            );
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(attributes).map_err(output_error)?);
        }
    }
    Ok(())
}

/// Render the configuration with secrets masked
pub fn render_config(config: &EngineConfig, format: ConfigFormat) -> Result<String, CliError> {
    let redacted = config.redacted();
    match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&redacted).map_err(output_error),
        ConfigFormat::Json => serde_json::to_string_pretty(&redacted).map_err(output_error),
        ConfigFormat::Toml => toml::to_string_pretty(&redacted).map_err(output_error),
    }
}

fn execute_config_command(config: &EngineConfig, format: ConfigFormat) -> Result<(), CliError> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

/// Configuration for consuming a single queue
///
/// Other queues are dropped so they need no handler.
pub fn consumer_config(mut config: EngineConfig, queue: &str) -> Result<EngineConfig, CliError> {
    let mut descriptor: QueueDescriptor = config
        .queue(queue)
        .cloned()
        .ok_or_else(|| ConfigurationError::UnknownQueue {
            queue: queue.to_string(),
        })?;
    descriptor.mode = QueueMode::Consumer;
    descriptor.consumer.batch = Some(false);
    config.queues = vec![descriptor];
    Ok(config)
}

async fn execute_consume_command(
    config: EngineConfig,
    queue: &str,
    limit: Option<usize>,
) -> Result<(), CliError> {
    let config = consumer_config(config, queue)?;
    let name = config.queues[0].name.clone();

    let consumed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Notify::new());

    let mut registry = HandlerRegistry::new();
    let handler = {
        let consumed = consumed.clone();
        let done = done.clone();
        Handler::single(move |message| {
            let consumed = consumed.clone();
            let done = done.clone();
            async move {
                let seen = consumed.fetch_add(1, Ordering::SeqCst);
                if limit.is_some_and(|limit| seen >= limit) {
                    // Past the limit: leave the message for another consumer.
                    return Err(HandlerError::new("consume limit reached"));
                }

                writeln!(std::io::stdout().lock(), "{}", message.body)
                    .context("failed to write message body")?;

                if limit.is_some_and(|limit| seen + 1 >= limit) {
                    done.notify_one();
                }
                Ok(())
            }
        })
    };
    registry
        .register(name, handler)?
        .on(EventKind::Error, |event| {
            warn!(queue = %event.queue(), "Queue error: {:?}", event);
            Ok(())
        });

    let engine = Engine::from_config(config, registry)?;
    engine.start()?;
    info!(queue = %queue, limit = ?limit, "Consuming; press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
        _ = done.notified() => {
            info!("Message limit reached");
        }
    }

    engine.stop().await;
    Ok(())
}

/// Execute completions command
fn execute_completions_command(shell: clap_complete::Shell) -> Result<(), CliError> {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
