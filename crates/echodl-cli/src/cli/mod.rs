//! CLI for the echodl download manager.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use echodl_core::config;
use echodl_core::resume::ResumeStore;
use std::path::PathBuf;

use commands::{
    run_add, run_cancel, run_engine, run_pause, run_priority, run_resume, run_status,
};

/// Top-level CLI for the echodl download manager.
#[derive(Debug, Parser)]
#[command(name = "echodl")]
#[command(about = "echodl: segmented, resumable download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download job to the queue.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,

        /// Destination file or directory (default: current directory).
        #[arg(long, value_name = "PATH")]
        dest: Option<PathBuf>,

        /// Priority; higher runs first (default 0).
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Run the engine until the queue is drained. Ctrl-C pauses running
    /// jobs and keeps their progress.
    Run {
        /// Run up to N jobs concurrently (overrides the config value).
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
    },

    /// Show status of all jobs.
    Status,

    /// Pause a queued or running job by its ID.
    Pause {
        /// Job identifier.
        id: i64,
    },

    /// Re-queue a paused job by its ID.
    Resume {
        /// Job identifier.
        id: i64,
    },

    /// Cancel a job by its ID.
    Cancel {
        /// Job identifier.
        id: i64,

        /// Also delete the partial download file.
        #[arg(long)]
        delete_file: bool,
    },

    /// Change a job's priority.
    Priority {
        /// Job identifier.
        id: i64,

        /// New priority; higher runs first.
        priority: i32,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let store = ResumeStore::open_default().await?;

        match cli.command {
            CliCommand::Add {
                url,
                dest,
                priority,
            } => run_add(&store, &url, dest, priority).await?,
            CliCommand::Run { jobs } => run_engine(&cfg, &store, jobs).await?,
            CliCommand::Status => run_status(&store).await?,
            CliCommand::Pause { id } => run_pause(&store, id).await?,
            CliCommand::Resume { id } => run_resume(&store, id).await?,
            CliCommand::Cancel { id, delete_file } => run_cancel(&store, id, delete_file).await?,
            CliCommand::Priority { id, priority } => run_priority(&store, id, priority).await?,
        }

        Ok(())
    }
}
