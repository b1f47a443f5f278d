use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use roseram::logging::{default_log_dir, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "roseram")]
#[command(version, about = "Working branches and live previews for GitHub-backed projects")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Write logs to ~/.roseram/logs instead of stderr
    #[arg(long, global = true)]
    pub log_to_file: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the workspace server (HTTP commands + WebSocket events)
    Serve {
        /// Port to serve on (defaults to [server] port in roseram.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (bind 0.0.0.0, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Acquire a working branch and run its preview until Ctrl+C
    Up {
        /// Project identifier used for the working branch name
        #[arg(long)]
        project: String,

        /// GitHub repository as owner/name or URL
        #[arg(long)]
        repo: String,

        /// Preview an existing branch instead of creating one
        #[arg(long)]
        branch: Option<String>,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default roseram.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `up` draws spinners on the terminal, so its logs go to a file.
    let to_file = cli.log_to_file || matches!(cli.command, Commands::Up { .. });
    let log_dir = if to_file { default_log_dir() } else { None };
    let _logging = init_logging(cli.verbose, log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(&project_dir, *port, *dev).await?,
        Commands::Up {
            project,
            repo,
            branch,
        } => cmd::cmd_up(&project_dir, project, repo, branch.as_deref()).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
