mod client;
mod config;
mod connection;
mod history;
mod logging;
mod protocol;
mod render;
mod stream;

use crate::client::{ClientEvent, ClientOptions, RunOutcome};
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionOptions};
use crate::stream::{AssemblerEvent, StreamSettings};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "tagstream", version)]
#[command(about = "Streaming client for tag-protocol agent backends", long_about = None)]
struct Cli {
    /// Config file (defaults to the usual search path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level for the console and log file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print messages as they stream in
    Listen {
        /// Socket address (ws:// or wss://)
        #[arg(long)]
        address: Option<String>,

        /// Primary task id
        #[arg(long)]
        task: Option<String>,

        /// Active sub-task ids, materialized ahead of the primary task
        #[arg(long = "subtask")]
        subtasks: Vec<String>,

        /// Message to send once connected
        #[arg(long)]
        message: Option<String>,

        /// Print each message as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Parse a document (file or stdin) and print the result as JSON
    Parse {
        file: Option<PathBuf>,
    },
    /// Parse and deduplicate a JSON history file
    Dedupe {
        file: PathBuf,
    },
}

/// One entry of a history file.
#[derive(Debug, Deserialize)]
struct HistoryEntry {
    text: String,
    #[serde(default)]
    msgid: Option<String>,
    #[serde(default)]
    worker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = match &cli.config {
        Some(path) => (Config::load_from(path)?, Some(path.clone())),
        None => Config::load_with_path().unwrap_or_else(|e| {
            eprintln!("Warning: failed to load config, using defaults: {e}");
            (Config::default(), None)
        }),
    };

    match cli.cmd {
        // Offline commands print to stdout only.
        Command::Parse { file } => {
            let document = read_input(file.as_deref())?;
            let message = protocol::parse(&document);
            eprintln!(
                "{} reply segment(s), {} action(s), {} dropped tag(s)",
                message.replies().count(),
                message.tool_actions().count(),
                message.dropped
            );
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Command::Dedupe { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let entries: Vec<HistoryEntry> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of history entries", file.display()))?;
            let mut messages: Vec<_> = entries
                .into_iter()
                .map(|e| protocol::parse(&e.text).with_ids(e.worker, e.msgid))
                .collect();
            let hidden = history::dedupe(&mut messages);
            eprintln!("{hidden} repeated action(s) hidden");
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Command::Listen {
            address,
            task,
            subtasks,
            message,
            json,
        } => {
            let log_dir = match logging::init(&config.logging, cli.log_level.as_deref()) {
                Ok(path) => Some(path),
                Err(err) => {
                    eprintln!("Failed to initialize logging: {err}");
                    None
                }
            };

            let mut config = config;
            if let Some(address) = address {
                config.server.address = address;
            }
            config.validate()?;

            tracing::info!("--- tagstream listen ---");
            match config_path.as_ref() {
                Some(path) => tracing::info!("Config File: {}", path.display()),
                None => tracing::info!("Config File: (default)"),
            }
            if let Some(dir) = log_dir.as_ref() {
                tracing::info!("Log Directory: {}", dir.display());
            }

            let options = ClientOptions {
                address: config.socket_url()?,
                task_id: task,
                subtasks,
                initial_message: message,
                connection: ConnectionOptions::from_config(&config),
                stream: StreamSettings::from(&config.stream),
            };
            let outcome = listen(options, json).await?;
            if outcome == RunOutcome::ConnectivityLost {
                eprintln!("Connectivity lost, giving up.");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn listen(options: ClientOptions, json: bool) -> Result<RunOutcome> {
    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (sink, mut events) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, json);
        }
    });

    let outcome = client::run(options, sink, shutdown).await;
    let _ = printer.await;
    outcome
}

fn print_event(event: &ClientEvent, json: bool) {
    match event {
        ClientEvent::Assembler(AssemblerEvent::Message { task, message }) => {
            if json {
                match serde_json::to_string(message.as_ref()) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("Failed to encode message: {}", e),
                }
            } else if !message.is_empty() {
                println!("--- {task} ---\n{}", render::render_message(message));
            }
        }
        ClientEvent::Assembler(AssemblerEvent::RunFailed { task, error }) => {
            eprintln!("Run failed ({}): {}", task_label(task), error.message());
        }
        ClientEvent::Assembler(AssemblerEvent::Control { task, state }) => {
            tracing::info!("Task {} is {}", task_label(task), state);
        }
        ClientEvent::Assembler(AssemblerEvent::Cleared { task }) => {
            tracing::debug!("Cleared in-flight message for {}", task_label(task));
        }
        ClientEvent::Assembler(AssemblerEvent::UserInput { task }) => {
            tracing::debug!("User input accepted for {}", task_label(task));
        }
        ClientEvent::Assembler(AssemblerEvent::Respond { task }) => {
            tracing::debug!("Response started for {}", task_label(task));
        }
        ClientEvent::Assembler(AssemblerEvent::FileChange { task, detail }) => {
            tracing::info!("File change in {}: {}", task_label(task), detail);
        }
        ClientEvent::Connection(ConnectionEvent::Reconnecting { attempt, delay }) => {
            eprintln!("Reconnecting in {}s (attempt {attempt})", delay.as_secs_f32());
        }
        ClientEvent::Connection(event) => tracing::debug!("{:?}", event),
    }
}

fn task_label(task: &Option<String>) -> &str {
    task.as_deref().unwrap_or("-")
}

fn read_input(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
