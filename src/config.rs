//! Configuration for the Roseram workspace orchestrator.
//!
//! Settings are read from `.roseram/roseram.toml` in the project directory and
//! layered as file → environment → CLI. Every key is optional.
//!
//! ```toml
//! [github]
//! api_url = "https://api.github.com"
//! branch_prefix = "roseram"
//! grace_period_ms = 3000
//! create_timeout_secs = 30
//!
//! [sandbox]
//! api_url = "http://127.0.0.1:8787"
//! poll_interval_ms = 5000
//! max_poll_attempts = 120
//! poll_budget_secs = 900
//! on_exhausted = "fail"
//! preview_url_template = "https://{name}.preview.roseram.dev"
//!
//! [sessions]
//! max_background_previews = 2
//!
//! [server]
//! port = 3141
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::workspace::orchestrator::WorkspaceSettings;
use crate::workspace::preview::ExhaustionPolicy;

/// Directory holding project-local state, relative to the project root.
pub const CONFIG_DIR: &str = ".roseram";
/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "roseram.toml";

/// `[github]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    /// Working branches are named `<branch_prefix>/<project-slug>`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// How long a branch create may run before the fallback list is fetched.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Hard ceiling on a pending branch create.
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,
    /// Never written to disk; comes from `GITHUB_TOKEN` or the CLI.
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_branch_prefix() -> String {
    "roseram".to_string()
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_create_timeout_secs() -> u64 {
    30
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            branch_prefix: default_branch_prefix(),
            grace_period_ms: default_grace_period_ms(),
            create_timeout_secs: default_create_timeout_secs(),
            token: None,
        }
    }
}

/// `[sandbox]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_api_url")]
    pub api_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Wall-clock ceiling for a provisioning run, transient failures included.
    #[serde(default = "default_poll_budget_secs")]
    pub poll_budget_secs: u64,
    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
    /// Must contain `{name}`; used to derive a URL when the service gives none.
    #[serde(default)]
    pub preview_url_template: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_sandbox_api_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_poll_budget_secs() -> u64 {
    900
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            api_url: default_sandbox_api_url(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_budget_secs: default_poll_budget_secs(),
            on_exhausted: ExhaustionPolicy::default(),
            preview_url_template: None,
            token: None,
        }
    }
}

/// `[sessions]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsSection {
    /// Previews kept alive for inactive sessions; `0` destroys them on switch.
    #[serde(default = "default_max_background_previews")]
    pub max_background_previews: usize,
}

fn default_max_background_previews() -> usize {
    2
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_background_previews: default_max_background_previews(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Root of `.roseram/roseram.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoseramConfig {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl RoseramConfig {
    /// Path of the config file for a project directory.
    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load the config file for `project_dir`, falling back to defaults when it
    /// doesn't exist, then apply environment overrides and validate.
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load only the file layer.
    pub fn load_file(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Apply environment overrides. `lookup` is injected so tests don't have to
    /// mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(url) = lookup("ROSERAM_GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(url) = lookup("ROSERAM_SANDBOX_URL") {
            self.sandbox.api_url = url;
        }
        if let Some(token) = lookup("ROSERAM_SANDBOX_TOKEN").filter(|t| !t.is_empty()) {
            self.sandbox.token = Some(token);
        }
    }

    /// Reject settings that would leave a state machine without a bounded path
    /// to a terminal state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.github.grace_period_ms == 0 {
            return Err(ConfigError::Invalid("github.grace_period_ms must be > 0".into()));
        }
        if self.github.create_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "github.create_timeout_secs must be > 0".into(),
            ));
        }
        if Duration::from_millis(self.github.grace_period_ms)
            >= Duration::from_secs(self.github.create_timeout_secs)
        {
            return Err(ConfigError::Invalid(
                "github.grace_period_ms must be shorter than github.create_timeout_secs".into(),
            ));
        }
        if self.github.branch_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("github.branch_prefix must not be empty".into()));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.poll_interval_ms must be > 0".into()));
        }
        if self.sandbox.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid("sandbox.max_poll_attempts must be > 0".into()));
        }
        if self.sandbox.poll_budget_secs == 0 {
            return Err(ConfigError::Invalid("sandbox.poll_budget_secs must be > 0".into()));
        }
        if let Some(template) = &self.sandbox.preview_url_template
            && !template.contains("{name}")
        {
            return Err(ConfigError::Invalid(format!(
                "sandbox.preview_url_template '{}' must contain {{name}}",
                template
            )));
        }
        Ok(())
    }

    /// Timing and policy knobs for the orchestrator.
    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            branch_prefix: self.github.branch_prefix.trim_matches('/').to_string(),
            grace_period: Duration::from_millis(self.github.grace_period_ms),
            create_timeout: Duration::from_secs(self.github.create_timeout_secs),
            poll_interval: Duration::from_millis(self.sandbox.poll_interval_ms),
            max_poll_attempts: self.sandbox.max_poll_attempts,
            poll_budget: Duration::from_secs(self.sandbox.poll_budget_secs),
            on_exhausted: self.sandbox.on_exhausted,
            preview_url_template: self.sandbox.preview_url_template.clone(),
            max_background_previews: self.sessions.max_background_previews,
        }
    }

    /// Render as TOML (tokens are never serialized).
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write a default config file unless one exists. Returns whether a file
    /// was written.
    pub fn init_file(project_dir: &Path) -> anyhow::Result<bool> {
        let path = Self::path_for(project_dir);
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, Self::default().to_toml()?)?;
        Ok(true)
    }
}
