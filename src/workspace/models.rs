use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one logical workspace: a project bound to a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_id: String,
    pub owner: String,
    pub repo: String,
}

impl SessionKey {
    pub fn new(
        project_id: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.project_id, self.owner, self.repo)
    }
}

/// A branch offered as a fallback when the working branch can't be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingBranch {
    pub name: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchState {
    #[default]
    Idle,
    Requesting,
    Succeeded {
        branch: String,
    },
    Failed {
        reason: String,
    },
    AwaitingUserChoice {
        /// Set when the create call failed or timed out; `None` on the slow path.
        reason: Option<String>,
        existing: Vec<ExistingBranch>,
    },
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::AwaitingUserChoice { .. } => "awaiting_user_choice",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Self::Succeeded { branch } => Some(branch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PreviewState {
    NotStarted,
    Launching,
    Provisioning,
    Running {
        url: String,
        /// True when the URL was derived after the poll budget ran out rather
        /// than reported by the sandbox service.
        assumed: bool,
    },
    Error {
        message: String,
    },
    Stopped,
}

impl PreviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Launching => "launching",
            Self::Provisioning => "provisioning",
            Self::Running { .. } => "running",
            Self::Error { .. } => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Stopped)
    }

    /// Launching or provisioning: a remote request or poll loop is active.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Launching | Self::Provisioning)
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Running { url, .. } => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    #[serde(flatten)]
    pub state: BranchState,
    /// The create call outlived the grace period.
    pub slow: bool,
    pub create_pending: bool,
    pub fetching_existing: bool,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl BranchSnapshot {
    /// Nothing further will happen without a user command.
    pub fn is_settled(&self) -> bool {
        match &self.state {
            BranchState::Idle | BranchState::Succeeded { .. } => true,
            BranchState::Requesting => false,
            BranchState::Failed { .. } => !self.fetching_existing,
            BranchState::AwaitingUserChoice { .. } => !self.create_pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSnapshot {
    pub branch: String,
    pub remote_id: Option<String>,
    #[serde(flatten)]
    pub state: PreviewState,
    pub poll_attempt: u32,
    pub poll_started_at: Option<DateTime<Utc>>,
    pub transient_failures: u32,
}

/// Everything a consumer needs to render one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub active: bool,
    pub branch: BranchSnapshot,
    pub preview: Option<PreviewSnapshot>,
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}
