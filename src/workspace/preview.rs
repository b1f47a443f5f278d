//! Preview provisioning: turn a `(SessionKey, branch)` into a reachable URL.
//!
//! ```text
//! NotStarted ─start─▶ Launching ─created─▶ Provisioning ─poll─▶ Running(url)
//!                         │                    │  ▲  │
//!                         │                    │  └──┘ pending (poll_attempt += 1)
//!                         └────────────────────┴──────────▶ Error(message)
//! any ─stop─▶ Stopped          Error | Stopped ─reset─▶ NotStarted
//! ```
//!
//! The launch task owns the create call; once the instance is provisioning it
//! hands off to a poll loop built on [`poll_until`], stored on the session so
//! `stop` can abort it. Every write re-checks the session generation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{PreviewSnapshot, PreviewState, SessionKey};
use super::orchestrator::Shared;
use super::sandbox::{
    CreatedInstance, InstanceRequest, InstanceStatus, SandboxService, SandboxStatus, preview_url,
    sandbox_name,
};
use super::timer::{PollOutcome, PollSchedule, Tick, TimerHandle, poll_until};
use crate::errors::{ServiceError, WorkspaceError};

pub const PROVISIONING_TIMEOUT_MESSAGE: &str = "provisioning timeout";
const DEFAULT_ERROR_MESSAGE: &str = "sandbox provisioning failed";

/// What to do when polling runs out without a terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Surface `Error("provisioning timeout")`.
    #[default]
    Fail,
    /// Report `Running` with the derived URL when one is known; the consumer's
    /// own health check catches a dead sandbox.
    AssumeReady,
}

#[derive(Debug)]
pub(crate) struct PreviewSession {
    branch: String,
    remote_id: Option<String>,
    state: PreviewState,
    poll_attempt: u32,
    poll_started_at: Option<DateTime<Utc>>,
    transient_failures: u32,
    last_known_url: Option<String>,
    sandbox_name: String,
    generation: u64,
    poller: Option<TimerHandle>,
}

impl PreviewSession {
    pub fn launching(key: &SessionKey, branch: &str, generation: u64) -> Self {
        Self {
            branch: branch.to_string(),
            remote_id: None,
            state: PreviewState::Launching,
            poll_attempt: 0,
            poll_started_at: None,
            transient_failures: 0,
            last_known_url: None,
            sandbox_name: sandbox_name(key, branch),
            generation,
            poller: None,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn state(&self) -> &PreviewState {
        &self.state
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        PreviewSnapshot {
            branch: self.branch.clone(),
            remote_id: self.remote_id.clone(),
            state: self.state.clone(),
            poll_attempt: self.poll_attempt,
            poll_started_at: self.poll_started_at,
            transient_failures: self.transient_failures,
        }
    }

    /// A sandbox may exist remotely for this session.
    pub fn holds_sandbox(&self) -> bool {
        !matches!(self.state, PreviewState::NotStarted | PreviewState::Stopped)
    }

    fn is_current(&self, generation: u64, state: &PreviewState) -> bool {
        self.generation == generation && &self.state == state
    }

    fn derived_url(&self, template: Option<&str>) -> Option<String> {
        self.last_known_url
            .clone()
            .or_else(|| template.map(|t| preview_url(t, &self.sandbox_name)))
    }

    fn request(&self, key: &SessionKey) -> InstanceRequest {
        InstanceRequest {
            owner: key.owner.clone(),
            repo: key.repo.clone(),
            branch: self.branch.clone(),
            name: self.sandbox_name.clone(),
        }
    }

    /// Apply the create response. Returns `None` when the session moved on
    /// while the request was in flight.
    fn on_created(
        &mut self,
        generation: u64,
        result: Result<CreatedInstance, ServiceError>,
    ) -> Option<Launched> {
        if !self.is_current(generation, &PreviewState::Launching) {
            return None;
        }
        let created = match result {
            Ok(created) => created,
            Err(e) => {
                self.state = PreviewState::Error {
                    message: e.to_string(),
                };
                return Some(Launched::Settled);
            }
        };
        self.remote_id = Some(created.id);
        if created.url.is_some() {
            self.last_known_url = created.url.clone();
        }
        match (created.status, created.url) {
            (SandboxStatus::Running, Some(url)) => {
                self.state = PreviewState::Running {
                    url,
                    assumed: false,
                };
                Some(Launched::Settled)
            }
            (SandboxStatus::Error, _) => {
                self.state = PreviewState::Error {
                    message: created
                        .error
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                };
                Some(Launched::Settled)
            }
            _ => {
                self.state = PreviewState::Provisioning;
                self.poll_started_at = Some(Utc::now());
                Some(Launched::Polling)
            }
        }
    }

    /// Remote id to poll, if this session is still the one polling.
    fn poll_target(&self, generation: u64) -> Option<String> {
        if self.is_current(generation, &PreviewState::Provisioning) {
            self.remote_id.clone()
        } else {
            None
        }
    }

    fn on_status(
        &mut self,
        generation: u64,
        result: Result<InstanceStatus, ServiceError>,
        template: Option<&str>,
    ) -> Tick<()> {
        if !self.is_current(generation, &PreviewState::Provisioning) {
            return Tick::Abandon;
        }
        let status = match result {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                self.transient_failures += 1;
                tracing::warn!(
                    remote_id = ?self.remote_id,
                    failures = self.transient_failures,
                    error = %e,
                    "preview status check failed, will retry"
                );
                return Tick::Skipped;
            }
            Err(e) => {
                self.state = PreviewState::Error {
                    message: e.to_string(),
                };
                return Tick::Ready(());
            }
        };
        if status.url.is_some() {
            self.last_known_url = status.url.clone();
        }
        match status.status {
            SandboxStatus::Running => match self.derived_url(template) {
                Some(url) => {
                    self.state = PreviewState::Running {
                        url,
                        assumed: false,
                    };
                    Tick::Ready(())
                }
                None => {
                    self.poll_attempt += 1;
                    Tick::Pending
                }
            },
            SandboxStatus::Error => {
                self.state = PreviewState::Error {
                    message: status
                        .error
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
                };
                Tick::Ready(())
            }
            SandboxStatus::Pending | SandboxStatus::Provisioning | SandboxStatus::Unknown => {
                self.poll_attempt += 1;
                Tick::Pending
            }
        }
    }

    /// Polling ran out of attempts or wall-clock budget.
    fn on_exhausted(
        &mut self,
        generation: u64,
        policy: ExhaustionPolicy,
        template: Option<&str>,
    ) -> bool {
        if !self.is_current(generation, &PreviewState::Provisioning) {
            return false;
        }
        self.poller = None;
        self.state = match (policy, self.derived_url(template)) {
            (ExhaustionPolicy::AssumeReady, Some(url)) => PreviewState::Running { url, assumed: true },
            _ => PreviewState::Error {
                message: PROVISIONING_TIMEOUT_MESSAGE.to_string(),
            },
        };
        true
    }

    /// Stop polling and mark stopped. Returns whether anything changed and the
    /// remote instance to destroy, if any.
    pub fn stop(&mut self) -> (bool, Option<String>) {
        if self.state == PreviewState::Stopped {
            return (false, None);
        }
        if let Some(poller) = self.poller.take() {
            poller.cancel();
        }
        self.state = PreviewState::Stopped;
        (true, self.remote_id.take())
    }

    /// Return a finished preview to `NotStarted`. An errored instance that
    /// still exists remotely is handed back for destruction.
    pub fn reset(&mut self) -> Result<Option<String>, WorkspaceError> {
        if !self.state.is_terminal() {
            return Err(WorkspaceError::InvalidTransition {
                from: self.state.as_str(),
                command: "reset the preview",
            });
        }
        self.state = PreviewState::NotStarted;
        self.poll_attempt = 0;
        self.poll_started_at = None;
        self.transient_failures = 0;
        self.last_known_url = None;
        Ok(self.remote_id.take())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launched {
    Settled,
    Polling,
}

/// Spawn the create call for a freshly launched session.
pub(crate) fn start_launch(shared: &Arc<Shared>, key: &SessionKey, session: &PreviewSession) {
    tracing::info!(
        key = %key,
        branch = %session.branch,
        sandbox = %session.sandbox_name,
        generation = session.generation,
        "launching preview"
    );
    tokio::spawn(run_launch(
        Arc::clone(shared),
        key.clone(),
        session.generation,
        session.request(key),
    ));
}

async fn run_launch(shared: Arc<Shared>, key: SessionKey, generation: u64, request: InstanceRequest) {
    let result = shared.sandbox.create_instance(&request).await;
    let created_id = result.as_ref().ok().map(|c| c.id.clone());
    if let Err(e) = &result {
        tracing::warn!(key = %key, branch = %request.branch, error = %e, "preview launch failed");
    }

    let launched = shared
        .apply(&key, |entry| {
            let launched = entry
                .preview
                .as_mut()
                .and_then(|p| p.on_created(generation, result));
            if launched == Some(Launched::Polling)
                && let Some(preview) = entry.preview.as_mut()
            {
                let poller = TimerHandle::spawn(run_poll(Arc::clone(&shared), key.clone(), generation));
                preview.poller = Some(poller);
            }
            (launched, launched.is_some())
        })
        .flatten();

    if launched.is_none()
        && let Some(remote_id) = created_id
    {
        tracing::info!(key = %key, remote_id = %remote_id, "destroying orphaned preview");
        destroy_in_background(Arc::clone(&shared.sandbox), remote_id);
    }
}

async fn run_poll(shared: Arc<Shared>, key: SessionKey, generation: u64) {
    let settings = &shared.settings;
    let schedule = PollSchedule {
        interval: settings.poll_interval,
        max_attempts: settings.max_poll_attempts,
        budget: settings.poll_budget,
    };
    let template = settings.preview_url_template.as_deref();

    let outcome = poll_until(schedule, |attempt| {
        let shared = Arc::clone(&shared);
        let key = key.clone();
        async move {
            let target = shared
                .read(&key, |entry| {
                    entry.preview.as_ref().and_then(|p| p.poll_target(generation))
                })
                .flatten();
            let Some(remote_id) = target else {
                return Tick::Abandon;
            };
            tracing::debug!(key = %key, remote_id = %remote_id, attempt, "polling preview status");
            let result = shared.sandbox.get_status(&remote_id).await;
            shared
                .apply(&key, |entry| match entry.preview.as_mut() {
                    Some(p) => {
                        let tick = p.on_status(
                            generation,
                            result,
                            shared.settings.preview_url_template.as_deref(),
                        );
                        let changed = tick.changed();
                        (tick, changed)
                    }
                    None => (Tick::Abandon, false),
                })
                .unwrap_or(Tick::Abandon)
        }
    })
    .await;

    match outcome {
        PollOutcome::Ready { attempts, .. } => {
            tracing::info!(key = %key, attempts, "preview provisioning finished");
            shared.apply(&key, |entry| {
                if let Some(p) = entry.preview.as_mut()
                    && p.generation == generation
                {
                    p.poller = None;
                }
                ((), false)
            });
        }
        PollOutcome::Exhausted { attempts } | PollOutcome::BudgetElapsed { attempts } => {
            tracing::warn!(
                key = %key,
                attempts,
                policy = ?settings.on_exhausted,
                "preview polling exhausted"
            );
            shared.apply(&key, |entry| {
                let changed = entry.preview.as_mut().is_some_and(|p| {
                    p.on_exhausted(generation, settings.on_exhausted, template)
                });
                ((), changed)
            });
        }
        PollOutcome::Abandoned => {
            tracing::debug!(key = %key, generation, "preview poll loop abandoned");
        }
    }
}

/// Best-effort teardown; failures are logged and never surfaced.
pub(crate) fn destroy_in_background(sandbox: Arc<dyn SandboxService>, remote_id: String) {
    tokio::spawn(async move {
        match sandbox.destroy_instance(&remote_id).await {
            Ok(()) => tracing::info!(remote_id = %remote_id, "preview destroyed"),
            Err(e) => {
                tracing::warn!(remote_id = %remote_id, error = %e, "failed to destroy preview")
            }
        }
    });
}
