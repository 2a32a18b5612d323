//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the dataflow worker.

use clap::{Parser, Subcommand};

/// Dataflow Worker - task execution core of a distributed dataflow engine
///
/// Reads task descriptors and control messages as JSON lines, runs each task
/// to completion on this machine, and reports commits, spawned children and
/// failures back as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "dataflow-worker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the worker
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the task host over a JSON-lines stream
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "DATAFLOW_CONFIG")]
        config: Option<String>,

        /// Read worker input from this file instead of stdin
        #[arg(short, long)]
        input: Option<String>,

        /// Write coordinator messages to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List registered task handlers and built-in programs
    Handlers,

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
