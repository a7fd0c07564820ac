//! CLI surface: argument parsing and command handlers.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Task-orchestration runtime: recursive decomposition, DAG
/// scheduling, and multiplexed progress streaming.
#[derive(Parser, Debug)]
#[command(name = "vibeflow", version, about)]
pub struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Explicit config file (otherwise the .vibeflow/ hierarchy)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the orchestration runtime in the foreground
    Start {
        /// Generalist workers to register (default: max concurrent tasks)
        #[arg(long)]
        workers: Option<usize>,

        /// Do not attach the stdio transport to this terminal
        #[arg(long)]
        no_stdio: bool,
    },

    /// Stop a running daemon via its pidfile
    Stop,

    /// Show daemon, transport, and session status
    Status {
        /// Also render each persisted session's execution waves
        #[arg(long)]
        plan: bool,
    },

    /// Stream progress events for a job
    Subscribe {
        /// Job to follow
        job_id: Uuid,

        /// SSE endpoint (default: the configured sse binding)
        #[arg(long)]
        endpoint: Option<String>,
    },
}
