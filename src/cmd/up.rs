//! One-shot workspace command (`roseram up`).
//!
//! Acquires a working branch for a single project, launches its preview and
//! keeps the sandbox alive until Ctrl+C.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use roseram::config::RoseramConfig;
use roseram::workspace::github::parse_owner_repo;
use roseram::workspace::models::PreviewSnapshot;
use roseram::workspace::{BranchState, Orchestrator, PreviewState, SessionKey, WorkspaceEvent};

pub async fn cmd_up(
    project_dir: &std::path::Path,
    project: &str,
    repo: &str,
    branch: Option<&str>,
) -> Result<()> {
    let Some((owner, repo)) = parse_owner_repo(repo) else {
        bail!("Invalid repository '{}': expected owner/name or a GitHub URL", repo);
    };
    if project.trim().is_empty() {
        bail!("Project id must not be empty");
    }

    let config = RoseramConfig::load(project_dir).context("Failed to load configuration")?;
    let orchestrator = Orchestrator::from_config(&config)?;
    let key = SessionKey::new(project, owner, repo);
    orchestrator.activate(&key);

    let branch = match branch {
        Some(branch) => branch.to_string(),
        None => acquire(&orchestrator, &key).await?,
    };

    // Subscribe before starting so no transition is missed.
    let events = orchestrator.subscribe();
    let snapshot = orchestrator.start_preview(&key, Some(&branch))?;
    let outcome = wait_for_preview(&orchestrator, &key, events, snapshot.preview).await;

    let url = match outcome {
        Ok(url) => url,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e);
        }
    };

    println!();
    println!(
        "{} {}",
        style("Preview running:").bold().green(),
        style(&url).cyan().underlined()
    );
    println!("  branch: {}", branch);
    println!();
    println!("Press Ctrl+C to stop the preview and exit.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    let destroyed = orchestrator.shutdown().await;
    println!("Stopped {} preview(s).", destroyed);
    Ok(())
}

fn spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {msg}")?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn acquire(orchestrator: &Orchestrator, key: &SessionKey) -> Result<String> {
    let pb = spinner("branch")?;
    pb.set_message(format!("Creating working branch in {}/{}...", key.owner, key.repo));

    orchestrator.acquire_branch(key)?;
    let state = orchestrator.wait_for_branch(key).await?;
    pb.finish_and_clear();

    match state {
        BranchState::Succeeded { branch } => {
            println!("{} {}", style("Working branch:").bold(), branch);
            Ok(branch)
        }
        BranchState::AwaitingUserChoice { reason, existing } => {
            if let Some(reason) = reason {
                println!("{} {}", style("Could not create a branch:").yellow(), reason);
            }
            if existing.is_empty() {
                bail!("No existing branches to fall back to");
            }
            println!("Existing branches (newest first):");
            for candidate in &existing {
                match candidate.updated_at {
                    Some(at) => println!("  {}  ({})", candidate.name, at.format("%Y-%m-%d %H:%M")),
                    None => println!("  {}", candidate.name),
                }
            }
            bail!("Re-run with --branch <name> to preview one of these branches")
        }
        BranchState::Failed { reason } => bail!("Branch acquisition failed: {}", reason),
        other => bail!("Branch acquisition stopped in state '{}'", other.as_str()),
    }
}

async fn wait_for_preview(
    orchestrator: &Orchestrator,
    key: &SessionKey,
    mut events: broadcast::Receiver<WorkspaceEvent>,
    initial: Option<PreviewSnapshot>,
) -> Result<String> {
    let pb = spinner("preview")?;
    pb.set_message("Launching sandbox...");

    let mut latest = initial;
    loop {
        if let Some(preview) = &latest {
            match &preview.state {
                PreviewState::Running { url, assumed } => {
                    pb.finish_and_clear();
                    if *assumed {
                        println!(
                            "{}",
                            style("Status polling ran out; the preview URL is assumed ready.")
                                .yellow()
                        );
                    }
                    return Ok(url.clone());
                }
                PreviewState::Error { message } => {
                    pb.finish_and_clear();
                    bail!("Preview failed: {}", message);
                }
                PreviewState::Stopped => {
                    pb.finish_and_clear();
                    bail!("Preview was stopped");
                }
                PreviewState::Provisioning => {
                    pb.set_message(format!("Provisioning (poll {})...", preview.poll_attempt));
                }
                PreviewState::Launching | PreviewState::NotStarted => {}
            }
        }

        match events.recv().await {
            Ok(WorkspaceEvent::StateChanged { snapshot, .. }) if snapshot.key == *key => {
                latest = snapshot.preview;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event stream lagged; re-reading snapshot");
                latest = orchestrator.snapshot(key)?.preview;
            }
            Err(broadcast::error::RecvError::Closed) => {
                pb.finish_and_clear();
                bail!("Event stream closed before the preview settled");
            }
        }
    }
}
