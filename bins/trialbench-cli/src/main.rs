mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trialbench_common::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "trialbench-cli")]
#[command(about = "Trialbench CLI - Scaffold configuration, rebuild summaries, clean stale workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default harness configuration file
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing configuration
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Rebuild the overall summary from per-task summary.json files
    Summarize {
        /// Directory holding one subdirectory per task
        #[arg(short, long)]
        root: PathBuf,

        /// Harness configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Remove workspaces left behind by an interrupted or crashed run
    Clean {
        /// Work root to sweep (defaults to the configured one)
        #[arg(short, long)]
        work_root: Option<PathBuf>,

        /// Harness configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path, force } => {
            commands::init_project(&path, force).await?;
        }
        Commands::Summarize { root, config } => {
            commands::summarize(&root, &config).await?;
        }
        Commands::Clean { work_root, config, yes } => {
            commands::clean(work_root.as_deref(), &config, yes).await?;
        }
    }

    Ok(())
}
