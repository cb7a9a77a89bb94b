//! EPMT CLI
//!
//! Command-line front end for the job performance pipeline: archive
//! submission, bounded batch runs, outlier reports, and daemon control.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{daemonctl, run, submit};
use std::path::PathBuf;

/// EPMT job performance pipeline CLI
#[derive(Parser)]
#[command(name = "epmt")]
#[command(author, version, about = "CLI for the EPMT job performance pipeline", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose pipeline logging
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit job archives and optionally drive them through the pipeline
    Submit {
        /// Job archives (.tgz) to ingest
        #[arg(required = true)]
        archives: Vec<PathBuf>,

        /// Abort the batch on the first failure or existing job
        #[arg(long)]
        fail_fast: bool,

        /// Replace a job that already exists
        #[arg(long)]
        force: bool,

        /// Concurrent submissions
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Post-process the ingested jobs immediately
        #[arg(long)]
        post_process: bool,

        /// Analyze the ingested jobs against their tag class
        #[arg(long)]
        analyze: bool,

        /// Print the root-cause table for every analyzed job
        #[arg(long)]
        report: bool,
    },

    /// Run bounded daemon iterations over a spool directory
    Run {
        /// Directory scanned for new job archives
        #[arg(long)]
        spool: PathBuf,

        /// Iterations to run (0 loops until interrupted)
        #[arg(long, default_value_t = 1)]
        niters: u64,

        /// Per-iteration time budget in seconds
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,

        /// Retire jobs older than this many days (0 disables)
        #[arg(long, default_value_t = 0.0)]
        retire_jobs_after_days: f64,

        /// Retire reference models older than this many days (0 disables)
        #[arg(long, default_value_t = 0.0)]
        retire_models_after_days: f64,
    },

    /// Control the background daemon
    #[command(subcommand)]
    Daemon(DaemonCommands),
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the daemon in the background
    Start {
        /// Daemon binary to launch
        #[arg(long, env = "EPMT_DAEMON_BIN", default_value = "epmtd")]
        bin: String,

        /// Pid lock file
        #[arg(long, env = "EPMT_PID_FILE")]
        pid_file: Option<PathBuf>,
    },

    /// Stop the running daemon with a graceful termination signal
    Stop {
        /// Pid lock file
        #[arg(long, env = "EPMT_PID_FILE")]
        pid_file: Option<PathBuf>,
    },

    /// Report whether the daemon is running
    Status {
        /// Pid lock file
        #[arg(long, env = "EPMT_PID_FILE")]
        pid_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    match cli.command {
        Commands::Submit {
            archives,
            fail_fast,
            force,
            concurrency,
            post_process,
            analyze,
            report,
        } => {
            submit::submit(
                &archives,
                submit::SubmitOptions {
                    fail_fast,
                    force,
                    concurrency,
                    post_process,
                    analyze,
                    report,
                },
                cli.format,
            )
            .await?;
        }
        Commands::Run {
            spool,
            niters,
            interval_secs,
            retire_jobs_after_days,
            retire_models_after_days,
        } => {
            run::run_batch(
                run::RunOptions {
                    spool,
                    niters,
                    interval_secs,
                    retire_jobs_after_days,
                    retire_models_after_days,
                },
                cli.format,
            )
            .await?;
        }
        Commands::Daemon(daemon_cmd) => match daemon_cmd {
            DaemonCommands::Start { bin, pid_file } => {
                daemonctl::start(&bin, pid_file)?;
            }
            DaemonCommands::Stop { pid_file } => {
                daemonctl::stop(pid_file)?;
            }
            DaemonCommands::Status { pid_file } => {
                daemonctl::status(pid_file)?;
            }
        },
    }

    Ok(())
}
