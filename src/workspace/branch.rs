//! Branch acquisition: obtain a branch the editor can write to.
//!
//! ```text
//! Idle ──acquire──▶ Requesting ──created──────────────────────────▶ Succeeded
//!                     │  │                                              ▲
//!                     │  └─grace─▶ (slow, list fetched) ──created───────┤
//!                     │                                                 │
//!                     └─failed/timeout─▶ Failed ──list──▶ AwaitingUserChoice
//!                                                             └─select──┘
//! ```
//!
//! Every async completion carries the generation it was started under and is
//! dropped when the acquisition has moved on (cancel, reset, a newer acquire,
//! or a user selection that already settled it).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::sleep;

use super::models::{BranchSnapshot, BranchState, ExistingBranch, SessionKey, slugify};
use super::orchestrator::Shared;
use super::timer::TimerHandle;
use crate::errors::{ServiceError, WorkspaceError};

const MAX_PROJECT_SLUG: usize = 40;

/// Reason recorded when the hard create timeout fires.
pub const CREATE_TIMEOUT_REASON: &str = "branch creation timed out";

/// Working branch for a project: `<prefix>/<project-slug>`.
pub fn working_branch_name(prefix: &str, project_id: &str) -> String {
    let slug = slugify(project_id, MAX_PROJECT_SLUG);
    let slug = if slug.is_empty() { "session" } else { &slug };
    format!("{}/{}", prefix, slug)
}

/// What applying a create result (or the create timeout) led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateOutcome {
    /// Stale or duplicate; nothing changed.
    Ignored,
    Succeeded,
    /// Failed, and the existing-branch list is already known or in flight.
    Failed,
    /// Failed; the caller must fetch the existing-branch list.
    FetchFallback,
}

#[derive(Debug, Default)]
pub(crate) struct BranchAcquisition {
    state: BranchState,
    slow: bool,
    create_pending: bool,
    listing: bool,
    attempt_started_at: Option<DateTime<Utc>>,
    timeout_at: Option<DateTime<Utc>>,
    generation: u64,
    timer: Option<TimerHandle>,
}

impl BranchAcquisition {
    /// An idle acquisition whose next attempt is `generation + 1`.
    pub fn starting_at(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &BranchState {
        &self.state
    }

    pub fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            state: self.state.clone(),
            slow: self.slow,
            create_pending: self.create_pending,
            fetching_existing: self.listing,
            attempt_started_at: self.attempt_started_at,
            timeout_at: self.timeout_at,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Start a new attempt. Returns the attempt's generation, or `None` when
    /// an attempt is already running or a branch is already held.
    pub fn begin(&mut self, now: DateTime<Utc>, timeout: std::time::Duration) -> Option<u64> {
        // A create still pending on the slow path counts as requesting.
        if self.create_pending
            || matches!(
                self.state,
                BranchState::Requesting | BranchState::Succeeded { .. }
            )
        {
            return None;
        }
        self.cancel_timer();
        self.generation += 1;
        self.state = BranchState::Requesting;
        self.slow = false;
        self.create_pending = true;
        self.listing = false;
        self.attempt_started_at = Some(now);
        self.timeout_at = chrono::Duration::from_std(timeout).ok().map(|d| now + d);
        Some(self.generation)
    }

    pub fn set_timer(&mut self, timer: TimerHandle) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.create_pending
    }

    /// The grace period passed with the create still pending. Returns true
    /// when the caller should fetch the existing-branch list.
    pub fn on_grace_elapsed(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != BranchState::Requesting {
            return false;
        }
        self.slow = true;
        self.listing = true;
        true
    }

    pub fn on_created(
        &mut self,
        generation: u64,
        result: Result<String, ServiceError>,
    ) -> CreateOutcome {
        if !self.is_current(generation) {
            tracing::debug!(generation, "dropping stale branch create result");
            return CreateOutcome::Ignored;
        }
        self.create_pending = false;
        self.cancel_timer();
        match result {
            Ok(branch) => {
                self.state = BranchState::Succeeded { branch };
                self.listing = false;
                CreateOutcome::Succeeded
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    /// The hard create timeout fired.
    pub fn on_create_timeout(&mut self, generation: u64) -> CreateOutcome {
        if !self.is_current(generation) {
            return CreateOutcome::Ignored;
        }
        self.create_pending = false;
        // The timer task is the caller; let it finish on its own.
        self.timer = None;
        self.fail(CREATE_TIMEOUT_REASON.to_string())
    }

    fn fail(&mut self, reason: String) -> CreateOutcome {
        match std::mem::take(&mut self.state) {
            BranchState::AwaitingUserChoice { existing, .. } => {
                self.state = BranchState::AwaitingUserChoice {
                    reason: Some(reason),
                    existing,
                };
                CreateOutcome::Failed
            }
            _ => {
                self.state = BranchState::Failed { reason };
                if self.listing {
                    CreateOutcome::Failed
                } else {
                    self.listing = true;
                    CreateOutcome::FetchFallback
                }
            }
        }
    }

    /// Apply an existing-branch listing. Returns true when the snapshot changed.
    pub fn on_branches_listed(
        &mut self,
        generation: u64,
        result: Result<Vec<ExistingBranch>, ServiceError>,
    ) -> bool {
        if self.generation != generation || !self.listing {
            tracing::debug!(generation, "dropping stale branch listing");
            return false;
        }
        self.listing = false;
        let existing = match result {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(generation, error = %e, "failed to list existing branches");
                return true;
            }
        };
        match std::mem::take(&mut self.state) {
            BranchState::Requesting => {
                self.state = BranchState::AwaitingUserChoice {
                    reason: None,
                    existing,
                };
            }
            BranchState::Failed { reason } => {
                self.state = BranchState::AwaitingUserChoice {
                    reason: Some(reason),
                    existing,
                };
            }
            other => self.state = other,
        }
        true
    }

    /// Settle on one of the offered branches. Any pending create result is
    /// ignored when it arrives.
    pub fn select(&mut self, name: &str) -> Result<(), WorkspaceError> {
        let BranchState::AwaitingUserChoice { existing, .. } = &self.state else {
            return Err(WorkspaceError::InvalidTransition {
                from: self.state.as_str(),
                command: "select a branch",
            });
        };
        if !existing.iter().any(|b| b.name == name) {
            return Err(WorkspaceError::BranchNotOffered {
                branch: name.to_string(),
            });
        }
        self.cancel_timer();
        self.create_pending = false;
        self.state = BranchState::Succeeded {
            branch: name.to_string(),
        };
        Ok(())
    }

    /// Abandon a running attempt. Returns false when already idle.
    pub fn cancel(&mut self) -> Result<bool, WorkspaceError> {
        match self.state {
            BranchState::Idle => Ok(false),
            BranchState::Succeeded { .. } => Err(WorkspaceError::InvalidTransition {
                from: self.state.as_str(),
                command: "cancel",
            }),
            _ => {
                self.reset();
                Ok(true)
            }
        }
    }

    /// Back to `Idle` from any state, invalidating in-flight results.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.generation += 1;
        self.state = BranchState::Idle;
        self.slow = false;
        self.create_pending = false;
        self.listing = false;
        self.attempt_started_at = None;
        self.timeout_at = None;
    }

    /// Cancel timers before the acquisition is dropped.
    pub fn teardown(&mut self) {
        self.cancel_timer();
        self.generation += 1;
    }
}

/// Spawn the create call and its deadline timer for attempt `generation`.
pub(crate) fn start_acquisition(shared: &Arc<Shared>, key: &SessionKey, generation: u64) {
    let branch = working_branch_name(&shared.settings.branch_prefix, &key.project_id);
    tracing::info!(
        project = %key.project_id,
        owner = %key.owner,
        repo = %key.repo,
        branch = %branch,
        generation,
        "requesting working branch"
    );

    tokio::spawn(run_create(
        Arc::clone(shared),
        key.clone(),
        generation,
        branch,
    ));

    let timer = TimerHandle::spawn(run_deadlines(Arc::clone(shared), key.clone(), generation));
    shared.apply(key, |entry| {
        if entry.branch.generation == generation && entry.branch.create_pending {
            entry.branch.set_timer(timer);
        } else {
            timer.cancel();
        }
        ((), false)
    });
}

async fn run_create(shared: Arc<Shared>, key: SessionKey, generation: u64, branch: String) {
    let result = async {
        let info = shared.github.get_repo_info(&key.owner, &key.repo).await?;
        shared
            .github
            .create_branch(&key.owner, &key.repo, &info.default_branch, &branch)
            .await
    }
    .await;

    if let Err(e) = &result {
        tracing::warn!(key = %key, branch = %branch, error = %e, "branch creation failed");
    }
    let outcome = shared.apply(&key, |entry| {
        let outcome = entry.branch.on_created(generation, result);
        (outcome, outcome != CreateOutcome::Ignored)
    });
    if outcome == Some(CreateOutcome::FetchFallback) {
        spawn_listing(&shared, &key, generation);
    }
}

async fn run_deadlines(shared: Arc<Shared>, key: SessionKey, generation: u64) {
    let grace = shared.settings.grace_period;
    let timeout = shared.settings.create_timeout;

    sleep(grace).await;
    let slow = shared.apply(&key, |entry| {
        let slow = entry.branch.on_grace_elapsed(generation);
        (slow, slow)
    });
    if slow == Some(true) {
        tracing::info!(key = %key, generation, "branch creation is slow, listing existing branches");
        spawn_listing(&shared, &key, generation);
    }

    sleep(timeout.saturating_sub(grace)).await;
    let outcome = shared.apply(&key, |entry| {
        let outcome = entry.branch.on_create_timeout(generation);
        (outcome, outcome != CreateOutcome::Ignored)
    });
    match outcome {
        Some(CreateOutcome::Ignored) | None => {}
        Some(outcome) => {
            tracing::warn!(key = %key, generation, "branch creation timed out");
            if outcome == CreateOutcome::FetchFallback {
                spawn_listing(&shared, &key, generation);
            }
        }
    }
}

fn spawn_listing(shared: &Arc<Shared>, key: &SessionKey, generation: u64) {
    let shared = Arc::clone(shared);
    let key = key.clone();
    tokio::spawn(async move {
        let result = shared.github.list_branches(&key.owner, &key.repo).await;
        shared.apply(&key, |entry| {
            let changed = entry.branch.on_branches_listed(generation, result);
            ((), changed)
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::test_support::{existing, forbidden};
    use std::time::Duration;

    fn requesting() -> (BranchAcquisition, u64) {
        let mut acq = BranchAcquisition::default();
        let generation = acq.begin(Utc::now(), Duration::from_secs(30)).unwrap();
        (acq, generation)
    }

    #[test]
    fn test_working_branch_name() {
        assert_eq!(working_branch_name("roseram", "p1"), "roseram/p1");
        assert_eq!(working_branch_name("edits", "My Project"), "edits/my-project");
        assert_eq!(working_branch_name("roseram", "!!!"), "roseram/session");
    }

    #[test]
    fn test_begin_is_noop_while_requesting_or_succeeded() {
        let (mut acq, generation) = requesting();
        assert!(acq.begin(Utc::now(), Duration::from_secs(30)).is_none());
        assert!(acq.snapshot().timeout_at.is_some());

        acq.on_created(generation, Ok("roseram/p1".into()));
        assert!(acq.begin(Utc::now(), Duration::from_secs(30)).is_none());
    }

    #[test]
    fn test_begin_is_noop_while_create_pending_on_slow_path() {
        let (mut acq, generation) = requesting();
        acq.on_grace_elapsed(generation);
        acq.on_branches_listed(generation, Ok(existing(&["main"])));
        assert!(matches!(acq.state(), BranchState::AwaitingUserChoice { .. }));

        assert!(acq.begin(Utc::now(), Duration::from_secs(30)).is_none());
        assert_eq!(
            acq.on_created(generation, Ok("roseram/p1".into())),
            CreateOutcome::Succeeded
        );
    }

    #[test]
    fn test_success_discards_pending_listing() {
        let (mut acq, generation) = requesting();
        assert!(acq.on_grace_elapsed(generation));
        assert!(acq.snapshot().slow);

        assert_eq!(
            acq.on_created(generation, Ok("roseram/p1".into())),
            CreateOutcome::Succeeded
        );
        assert!(!acq.on_branches_listed(generation, Ok(existing(&["main"]))));
        assert_eq!(
            acq.state(),
            &BranchState::Succeeded {
                branch: "roseram/p1".into()
            }
        );
    }

    #[test]
    fn test_failure_fetches_fallback_once() {
        let (mut acq, generation) = requesting();
        assert_eq!(
            acq.on_created(generation, Err(forbidden())),
            CreateOutcome::FetchFallback
        );
        assert!(matches!(acq.state(), BranchState::Failed { .. }));
        assert!(!acq.snapshot().is_settled());

        assert!(acq.on_branches_listed(generation, Ok(existing(&["main"]))));
        match acq.state() {
            BranchState::AwaitingUserChoice { reason, existing } => {
                assert_eq!(
                    reason.as_deref(),
                    Some("Resource not accessible by integration (HTTP 403)")
                );
                assert_eq!(existing.len(), 1);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_failure_after_slow_path_reuses_list() {
        let (mut acq, generation) = requesting();
        acq.on_grace_elapsed(generation);
        acq.on_branches_listed(generation, Ok(existing(&["main", "feature-x"])));
        assert!(!acq.snapshot().is_settled(), "create still pending");

        assert_eq!(acq.on_create_timeout(generation), CreateOutcome::Failed);
        match acq.state() {
            BranchState::AwaitingUserChoice { reason, existing } => {
                assert_eq!(reason.as_deref(), Some(CREATE_TIMEOUT_REASON));
                assert_eq!(existing.len(), 2);
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(acq.snapshot().is_settled());
    }

    #[test]
    fn test_failure_while_listing_waits_for_listing() {
        let (mut acq, generation) = requesting();
        acq.on_grace_elapsed(generation);
        assert_eq!(acq.on_created(generation, Err(forbidden())), CreateOutcome::Failed);
        assert!(acq.on_branches_listed(generation, Ok(existing(&["main"]))));
        assert!(matches!(
            acq.state(),
            BranchState::AwaitingUserChoice { reason: Some(_), .. }
        ));
    }

    #[test]
    fn test_listing_failure_leaves_failed_settled() {
        let (mut acq, generation) = requesting();
        acq.on_created(generation, Err(forbidden()));
        assert!(acq.on_branches_listed(generation, Err(forbidden())));
        assert!(matches!(acq.state(), BranchState::Failed { .. }));
        assert!(acq.snapshot().is_settled());
    }

    #[test]
    fn test_select_wins_over_late_create() {
        let (mut acq, generation) = requesting();
        acq.on_grace_elapsed(generation);
        acq.on_branches_listed(generation, Ok(existing(&["main", "feature-x"])));

        acq.select("feature-x").unwrap();
        assert_eq!(
            acq.on_created(generation, Ok("feature-y".into())),
            CreateOutcome::Ignored
        );
        assert_eq!(acq.state().branch(), Some("feature-x"));
    }

    #[test]
    fn test_select_rejects_unknown_branch_and_wrong_state() {
        let (mut acq, generation) = requesting();
        assert!(matches!(
            acq.select("main"),
            Err(WorkspaceError::InvalidTransition {
                from: "requesting",
                ..
            })
        ));
        acq.on_grace_elapsed(generation);
        acq.on_branches_listed(generation, Ok(existing(&["main"])));
        assert_eq!(
            acq.select("other"),
            Err(WorkspaceError::BranchNotOffered {
                branch: "other".into()
            })
        );
    }

    #[test]
    fn test_cancel_invalidates_results() {
        let (mut acq, generation) = requesting();
        assert_eq!(acq.cancel(), Ok(true));
        assert_eq!(acq.state(), &BranchState::Idle);
        assert_eq!(
            acq.on_created(generation, Ok("roseram/p1".into())),
            CreateOutcome::Ignored
        );
        assert!(!acq.on_grace_elapsed(generation));
        assert_eq!(acq.cancel(), Ok(false));
    }

    #[test]
    fn test_cancel_after_success_is_rejected() {
        let (mut acq, generation) = requesting();
        acq.on_created(generation, Ok("roseram/p1".into()));
        assert!(matches!(
            acq.cancel(),
            Err(WorkspaceError::InvalidTransition { command: "cancel", .. })
        ));
    }

    #[test]
    fn test_new_attempt_supersedes_failed_one() {
        let (mut acq, first) = requesting();
        acq.on_created(first, Err(forbidden()));
        let second = acq.begin(Utc::now(), Duration::from_secs(30)).unwrap();
        assert!(second > first);
        assert!(!acq.on_branches_listed(first, Ok(existing(&["main"]))));
        assert_eq!(acq.state(), &BranchState::Requesting);
    }
}
