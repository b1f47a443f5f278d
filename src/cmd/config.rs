//! Configuration view and bootstrap commands (`roseram config`).

use anyhow::Result;

use roseram::config::RoseramConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = RoseramConfig::path_for(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Roseram Configuration").bold().cyan());
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No roseram.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = RoseramConfig::load(project_dir)?;
            print!("{}", config.to_toml()?);
            println!();
            println!("Effective credentials (from environment):");
            println!(
                "  GITHUB_TOKEN = {}",
                if config.github.token.is_some() { "set" } else { "not set" }
            );
            println!(
                "  ROSERAM_SANDBOX_TOKEN = {}",
                if config.sandbox.token.is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Init) => {
            if !RoseramConfig::init_file(project_dir)? {
                println!("roseram.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            println!("Created roseram.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] api_url, branch_prefix, grace_period_ms, create_timeout_secs");
            println!("  - [sandbox] api_url, poll_interval_ms, max_poll_attempts, on_exhausted");
            println!("  - [sessions] max_background_previews");
            println!();
        }
    }

    Ok(())
}
