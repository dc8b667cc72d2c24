//! Command-line host for the Kindling extension runtime.
//!
//! Every invocation opens the data directory, registers the built-in
//! extensions, runs one command, prints JSON to stdout and tears the
//! registry down again.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kindling_core::config::env_vars;
use kindling_core::host::{ChannelNotifier, LocalMessageBridge, Notification, StorageBackend};
use kindling_core::{ExtensionRegistry, RuntimeConfig, ToolResult};
use kindling_extensions::{register_builtins, HostFactory};
use kindling_storage::{RedbBackend, DEFAULT_DB_FILE};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

/// Kindling - run and inspect in-process extensions.
#[derive(Parser, Debug)]
#[command(name = "kindling")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Directory holding the extension database.
    #[arg(long, global = true, env = env_vars::DATA_DIR, default_value = "data")]
    data_dir: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// List registered extensions.
    Extensions,
    /// List tools available to a tool-calling caller.
    Tools {
        /// Only tools owned by this extension.
        #[arg(short, long)]
        extension: Option<String>,
    },
    /// Execute a tool.
    Call {
        /// Tool name.
        tool: String,
        /// Arguments as a JSON object.
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Invoke a service of an extension.
    Invoke {
        /// Extension id.
        extension: String,
        /// Service name.
        service: String,
        /// Payload as JSON.
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },
    /// List UI slots with their current state.
    Slots,
    /// List state channels with their current value.
    Channels,
    /// Show registry statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let backend: Arc<dyn StorageBackend> = Arc::new(open_backend(&args.data_dir)?);
    let (notifier, notifications) = ChannelNotifier::new();
    let factory = HostFactory::new(backend)
        .with_notifier(Arc::new(notifier))
        .with_messaging(Arc::new(LocalMessageBridge::default()));

    let registry = ExtensionRegistry::with_config(RuntimeConfig::from_env());
    register_builtins(&registry, &factory)
        .await
        .context("Failed to register built-in extensions")?;

    let outcome = run(&registry, args.command).await;

    let removed = registry.destroy().await;
    tracing::debug!(removed, "Registry destroyed");
    drain_notifications(notifications);

    let (output, code) = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(code)
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "kindling=debug" } else { "kindling=warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr so stdout stays machine-readable
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn open_backend(data_dir: &Path) -> Result<RedbBackend> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let path = data_dir.join(DEFAULT_DB_FILE);
    RedbBackend::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON: {}", what, raw))
}

fn exit_code(result: &ToolResult) -> ExitCode {
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn run(registry: &ExtensionRegistry, command: Command) -> Result<(Value, ExitCode)> {
    let output = match command {
        Command::Extensions => serde_json::to_value(registry.list_extensions())?,
        Command::Tools { extension } => {
            let tools = match extension {
                Some(id) => registry.get_tools_by_extension(&id),
                None => registry.get_all_tools(),
            };
            serde_json::to_value(tools)?
        }
        Command::Call { tool, args } => {
            let args = parse_json(&args, "--args")?;
            let result = registry.execute_tool(&tool, args, None).await;
            let code = exit_code(&result);
            return Ok((serde_json::to_value(result)?, code));
        }
        Command::Invoke {
            extension,
            service,
            payload,
        } => {
            let payload = parse_json(&payload, "--payload")?;
            let result = registry
                .invoke_service(&extension, &service, payload, None)
                .await?;
            let code = exit_code(&result);
            return Ok((serde_json::to_value(result)?, code));
        }
        Command::Slots => {
            let mut slots = Vec::new();
            for slot in registry.get_slots() {
                let mut entry = serde_json::to_value(&slot)?;
                entry["state"] = serde_json::to_value(slot.state.get_state())?;
                slots.push(entry);
            }
            Value::Array(slots)
        }
        Command::Channels => {
            let mut channels = Vec::new();
            for channel in registry.get_state_channels() {
                let mut entry = serde_json::to_value(&channel)?;
                entry["value"] = channel.channel.get_state();
                channels.push(entry);
            }
            Value::Array(channels)
        }
        Command::Stats => json!({
            "stats": registry.get_stats(),
            "extensions": registry.get_extension_ids(),
        }),
    };
    Ok((output, ExitCode::SUCCESS))
}

fn drain_notifications(mut rx: UnboundedReceiver<Notification>) {
    while let Ok(notification) = rx.try_recv() {
        tracing::info!(
            title = %notification.title,
            body = %notification.body,
            "Notification"
        );
    }
}
