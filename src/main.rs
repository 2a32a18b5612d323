//! Dataflow Worker - worker-side execution core of a distributed dataflow engine
//!
//! This is the main entry point for the dataflow worker binary.
//! The worker reads task descriptors and control messages as JSON lines,
//! runs one task cycle at a time through the task host, and writes commits,
//! spawned children and failure reports back as JSON lines.

mod cli;
mod config;
mod coordinator;
mod error;
mod host;
mod logging;
mod protocol;
mod runtime;
mod store;
mod strategy;
mod types;
mod version;

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::WorkerConfig;
use crate::coordinator::StreamCoordinator;
use crate::error::{Error, Result};
use crate::host::TaskHost;
use crate::logging::LogGuards;
use crate::protocol::WorkerInput;
use crate::store::LocalBlockStore;
use crate::strategy::{ProgramRegistry, StrategyRegistry};
use crate::types::TaskDescriptor;

/// Tasks waiting for the host thread
const TASK_QUEUE_SIZE: usize = 64;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        Commands::Handlers => {
            logging::init_simple(tracing::Level::WARN)?;
            list_handlers();
            return Ok(());
        }
        _ => {}
    }

    let config_path = match &cli.command {
        Commands::Run { config, .. } => config.clone(),
        _ => None,
    };

    let config = match WorkerConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting dataflow worker"
    );

    match cli.command {
        Commands::Run { input, output, .. } => {
            run_worker(config, input, output)?;
        }
        Commands::Version | Commands::Config { .. } | Commands::Handlers => {
            // Already handled above
            unreachable!();
        }
    }

    Ok(())
}

fn init_logging_from_config(config: &WorkerConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

fn builtin_registry() -> (Arc<ProgramRegistry>, Arc<StrategyRegistry>) {
    let programs = Arc::new(ProgramRegistry::with_builtins());
    let strategies = Arc::new(StrategyRegistry::with_builtins(programs.clone()));
    (programs, strategies)
}

/// Run the task host until the input stream ends
fn run_worker(config: WorkerConfig, input: Option<String>, output: Option<String>) -> Result<()> {
    let worker_id = config
        .worker
        .id
        .clone()
        .unwrap_or_else(|| format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]));

    info!(
        worker_id = %worker_id,
        worker_name = %config.worker.name.as_deref().unwrap_or("(unnamed)"),
        inline_threshold = config.runtime.inline_threshold_bytes,
        stream_timeout_ms = config.runtime.stream_wait_timeout_ms,
        "Configuration loaded"
    );
    info!(
        data_dir = %config.storage.data_dir,
        block_dir = %config.storage.block_dir,
        "Storage paths configured"
    );

    ensure_directories(&config)?;

    let block_store = Arc::new(LocalBlockStore::open(config.block_dir())?);
    let (_, registry) = builtin_registry();

    let writer: Box<dyn Write + Send> = match output {
        Some(ref path) => {
            let file = File::create(path).map_err(|source| Error::IoWrite {
                path: path.into(),
                source,
            })?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout()),
    };
    let coordinator = Arc::new(StreamCoordinator::new(writer, Some(worker_id.clone())));

    let host = Arc::new(
        TaskHost::new(registry, coordinator, block_store, config.runtime.clone())
            .with_packages(config.packages.clone()),
    );
    info!(
        worker_id = %worker_id,
        handlers = ?host.registry().registered_handlers(),
        "Task host ready"
    );

    let reader: Box<dyn BufRead> = match input {
        Some(ref path) => {
            let file = File::open(path).map_err(|source| Error::IoRead {
                path: path.into(),
                source,
            })?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(io::stdin().lock()),
    };

    // Cycles run on their own thread so abort and streams-done messages
    // can reach a task while it is still running
    let (task_tx, task_rx) = mpsc::channel::<TaskDescriptor>(TASK_QUEUE_SIZE);
    let cycle_host = host.clone();
    let host_thread = thread::Builder::new()
        .name("task-host".to_string())
        .spawn(move || run_cycles(cycle_host, task_rx))
        .map_err(|e| Error::Internal(format!("Failed to start task host thread: {}", e)))?;

    info!("Worker input loop started");
    let mut malformed = 0u64;

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let message = match WorkerInput::parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                malformed += 1;
                warn!(line = number + 1, error = %e, "Skipping malformed input line");
                continue;
            }
        };
        debug!(line = number + 1, message_type = message.type_name(), "Input received");

        match message {
            WorkerInput::ExecuteTask { task } => {
                info!(task_id = %task.task_id, handler = %task.handler, "Task assigned");
                if task_tx.blocking_send(task).is_err() {
                    error!("Task host thread stopped, no further tasks can run");
                    break;
                }
            }
            WorkerInput::AbortTask { task_id, generation } => {
                let delivered = match generation {
                    Some(generation) => host.abort_task_at(&task_id, generation),
                    None => host.abort_task(&task_id),
                };
                if !delivered {
                    debug!(
                        task_id = %task_id,
                        ?generation,
                        running = ?host.current_cycle(),
                        "Abort for a task that is not running"
                    );
                }
            }
            WorkerInput::StreamsDone { task_id } => {
                host.notify_streams_done(&task_id);
            }
        }
    }

    // Let queued tasks drain before exiting
    drop(task_tx);
    let (committed, failed) = host_thread
        .join()
        .map_err(|_| Error::Internal("Task host thread panicked".to_string()))?;

    info!(committed, failed, malformed, "Worker shutting down");
    Ok(())
}

fn run_cycles(host: Arc<TaskHost>, mut tasks: mpsc::Receiver<TaskDescriptor>) -> (u64, u64) {
    let mut committed = 0;
    let mut failed = 0;
    while let Some(task) = tasks.blocking_recv() {
        match host.handle_input(task) {
            Ok(()) => committed += 1,
            Err(e) if e.is_fatal() => {
                failed += 1;
                error!("Task host stopping: {}", e.format_for_log());
                break;
            }
            Err(_) => failed += 1,
        }
    }
    (committed, failed)
}

/// Ensure required storage directories exist
fn ensure_directories(config: &WorkerConfig) -> Result<()> {
    for path in [config.data_dir(), config.block_dir()] {
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| Error::IoWrite {
                path: path.clone(),
                source: e,
            })?;
            info!(path = %path.display(), "Created directory");
        }
    }
    Ok(())
}

fn list_handlers() {
    let (programs, registry) = builtin_registry();

    println!("Task handlers:");
    for handler in registry.registered_handlers() {
        println!("  {}", handler);
    }

    println!();
    println!("Programs (for the 'script' handler):");
    for (name, description) in programs.list() {
        println!("  {:<10} {}", name, description);
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = WorkerConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate { config } => match WorkerConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
