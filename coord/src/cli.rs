//! CLI command definitions and subcommands

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// runcoord - controller/worker coordination for a shared store
#[derive(Parser, Debug)]
#[command(name = "runcoord")]
#[command(author, version, about = "Controller/worker coordination over a shared directory", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Project root containing the coordination directory
    #[arg(short, long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Environment the run needs in the store
#[derive(Args, Debug, Clone)]
pub struct EnvironmentArgs {
    /// Path to the shared store
    #[arg(short, long, default_value = "runcoord.db")]
    pub store: PathBuf,

    /// Environment name
    #[arg(short, long, default_value = "default")]
    pub environment: String,

    /// Installed package listing the fingerprint is computed from
    #[arg(long, default_value = "")]
    pub packages: String,

    /// Language/runtime version
    #[arg(long, default_value = "")]
    pub language_version: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pre-create the environment, publish state, and wait for workers
    Controller {
        /// Number of workers expected to acknowledge
        #[arg(short, long)]
        workers: usize,

        #[command(flatten)]
        env: EnvironmentArgs,

        /// Command to run while coordinating; cleanup follows its exit
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Wait for the controller's state, acknowledge it, and open the store read-only
    Worker {
        /// Worker id (defaults to RUNCOORD_WORKER_ID)
        #[arg(short, long, env = "RUNCOORD_WORKER_ID")]
        id: String,

        #[command(flatten)]
        env: EnvironmentArgs,
    },

    /// Show the published state and acknowledged workers
    Status,

    /// Remove the coordination directory
    Cleanup,

    /// Print the effective configuration
    Config,
}
