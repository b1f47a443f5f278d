//! Workspace server command (`roseram serve`).

use anyhow::{Context, Result};

use roseram::config::RoseramConfig;
use roseram::workspace::Orchestrator;
use roseram::workspace::server::{ServerConfig, start_server};

pub async fn cmd_serve(project_dir: &std::path::Path, port: Option<u16>, dev: bool) -> Result<()> {
    let config = RoseramConfig::load(project_dir).context("Failed to load configuration")?;
    if config.github.token.is_none() {
        tracing::warn!("GITHUB_TOKEN is not set; branch creation will likely be rejected");
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    start_server(
        ServerConfig {
            port: port.unwrap_or(config.server.port),
            dev_mode: dev,
        },
        orchestrator,
    )
    .await
}
