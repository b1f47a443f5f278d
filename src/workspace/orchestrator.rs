//! Session orchestrator: one branch acquisition and at most one preview per
//! [`SessionKey`].
//!
//! The session table behind a single mutex is the only shared mutable state.
//! Transitions are synchronous closures applied under that lock, and the
//! resulting snapshot is published before the lock is released, so events for
//! a key arrive in the order transitions were applied. Network calls run in
//! spawned tasks and re-enter through [`Shared::apply`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::broadcast;

use super::branch::{BranchAcquisition, start_acquisition};
use super::events::{EventBus, Subscription, WorkspaceEvent};
use super::github::{BranchService, GitHubClient};
use super::models::{BranchState, PreviewState, SessionKey, SessionSnapshot};
use super::preview::{ExhaustionPolicy, PreviewSession, destroy_in_background, start_launch};
use super::sandbox::{SandboxClient, SandboxService};
use crate::config::RoseramConfig;
use crate::errors::WorkspaceError;

/// Timing and policy knobs, resolved from `[github]`, `[sandbox]` and
/// `[sessions]` in the config file.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub branch_prefix: String,
    pub grace_period: Duration,
    pub create_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub poll_budget: Duration,
    pub on_exhausted: ExhaustionPolicy,
    pub preview_url_template: Option<String>,
    pub max_background_previews: usize,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            branch_prefix: "roseram".to_string(),
            grace_period: Duration::from_secs(3),
            create_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 120,
            poll_budget: Duration::from_secs(900),
            on_exhausted: ExhaustionPolicy::Fail,
            preview_url_template: None,
            max_background_previews: 2,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionEntry {
    pub(crate) branch: BranchAcquisition,
    pub(crate) preview: Option<PreviewSession>,
    preview_epoch: u64,
}

impl SessionEntry {
    fn starting_at(generation: u64) -> Self {
        Self {
            branch: BranchAcquisition::starting_at(generation),
            preview: None,
            preview_epoch: generation,
        }
    }

    /// Nothing running and nothing worth keeping: no branch held or pending,
    /// no sandbox alive.
    fn is_disposable(&self) -> bool {
        self.branch.state() == &BranchState::Idle
            && self.preview.as_ref().is_none_or(|p| !p.holds_sandbox())
    }

    fn snapshot(&self, key: &SessionKey, active: bool) -> SessionSnapshot {
        SessionSnapshot {
            key: key.clone(),
            active,
            branch: self.branch.snapshot(),
            preview: self.preview.as_ref().map(PreviewSession::snapshot),
        }
    }

    /// Stop the preview if it holds a sandbox; returns the instance to destroy.
    fn stop_preview(&mut self) -> (bool, Option<String>) {
        match self.preview.as_mut() {
            Some(preview) => preview.stop(),
            None => (false, None),
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    entries: HashMap<SessionKey, SessionEntry>,
    active: Option<SessionKey>,
    /// Activation or creation order, most recent last.
    recency: Vec<SessionKey>,
    /// Entries created so far; seeds the generation counters of new entries.
    created: u64,
}

impl SessionTable {
    fn is_active(&self, key: &SessionKey) -> bool {
        self.active.as_ref() == Some(key)
    }

    fn snapshot(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        self.entries
            .get(key)
            .map(|entry| entry.snapshot(key, self.is_active(key)))
    }

    fn touch(&mut self, key: &SessionKey) {
        self.recency.retain(|k| k != key);
        self.recency.push(key.clone());
    }

    /// The entry for `key`, created if missing. A new entry's counters start
    /// above those of any earlier entry for the same key, so late results
    /// addressed to a closed or dropped entry are never applied to it.
    fn entry_or_insert(&mut self, key: &SessionKey) -> &mut SessionEntry {
        if !self.entries.contains_key(key) {
            self.touch(key);
        }
        let created = &mut self.created;
        self.entries.entry(key.clone()).or_insert_with(|| {
            *created += 1;
            SessionEntry::starting_at(*created << 32)
        })
    }

    /// Drop inactive entries with nothing running, except `keep`. Returns the
    /// dropped keys.
    fn prune_idle(&mut self, keep: Option<&SessionKey>) -> Vec<SessionKey> {
        let disposable: Vec<SessionKey> = self
            .entries
            .iter()
            .filter(|(k, entry)| {
                !self.is_active(k) && keep != Some(*k) && entry.is_disposable()
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &disposable {
            if let Some(mut entry) = self.entries.remove(key) {
                entry.branch.teardown();
            }
            self.recency.retain(|k| k != key);
        }
        disposable
    }

    /// Stop previews of inactive sessions beyond the `keep` most recently
    /// active ones. Returns the affected keys and the instances to destroy.
    fn evict_background(&mut self, keep: usize) -> Vec<(SessionKey, Option<String>)> {
        let background: Vec<SessionKey> = self
            .recency
            .iter()
            .rev()
            .filter(|k| !self.is_active(k))
            .filter(|k| {
                self.entries
                    .get(*k)
                    .and_then(|e| e.preview.as_ref())
                    .is_some_and(PreviewSession::holds_sandbox)
            })
            .cloned()
            .collect();

        background
            .into_iter()
            .skip(keep)
            .filter_map(|key| {
                let entry = self.entries.get_mut(&key)?;
                let (_, remote_id) = entry.stop_preview();
                Some((key, remote_id))
            })
            .collect()
    }
}

/// State shared between the orchestrator handle and its spawned tasks.
pub(crate) struct Shared {
    pub(crate) github: Arc<dyn BranchService>,
    pub(crate) sandbox: Arc<dyn SandboxService>,
    pub(crate) settings: WorkspaceSettings,
    bus: EventBus,
    table: Mutex<SessionTable>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a transition to an existing session. `f` reports whether the
    /// snapshot changed; changed snapshots are published under the lock.
    /// Returns `None` when the session no longer exists.
    pub(crate) fn apply<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionEntry) -> (R, bool),
    ) -> Option<R> {
        let mut table = self.lock();
        let active = table.is_active(key);
        let entry = table.entries.get_mut(key)?;
        let (result, changed) = f(entry);
        if changed {
            self.bus.publish_state(entry.snapshot(key, active));
        }
        Some(result)
    }

    pub(crate) fn read<R>(&self, key: &SessionKey, f: impl FnOnce(&SessionEntry) -> R) -> Option<R> {
        self.lock().entries.get(key).map(f)
    }

    /// Apply a user command. `create` inserts an idle session for unknown keys.
    fn command(
        &self,
        key: &SessionKey,
        create: bool,
        f: impl FnOnce(&mut SessionEntry) -> Result<bool, WorkspaceError>,
    ) -> Result<SessionSnapshot, WorkspaceError> {
        let mut table = self.lock();
        let active = table.is_active(key);
        let entry = if create {
            table.entry_or_insert(key)
        } else {
            table
                .entries
                .get_mut(key)
                .ok_or_else(|| WorkspaceError::UnknownSession {
                    key: key.to_string(),
                })?
        };
        let changed = f(entry)?;
        let snapshot = entry.snapshot(key, active);
        if changed {
            self.bus.publish_state(snapshot.clone());
        }
        Ok(snapshot)
    }
}

/// Cloneable handle to the session orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        github: Arc<dyn BranchService>,
        sandbox: Arc<dyn SandboxService>,
        settings: WorkspaceSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                github,
                sandbox,
                settings,
                bus: EventBus::default(),
                table: Mutex::new(SessionTable::default()),
            }),
        }
    }

    /// Build HTTP clients for both services from a loaded config.
    pub fn from_config(config: &RoseramConfig) -> anyhow::Result<Self> {
        let github = GitHubClient::new(&config.github.api_url, config.github.token.clone())?;
        let sandbox = SandboxClient::new(&config.sandbox.api_url, config.sandbox.token.clone())?;
        Ok(Self::new(
            Arc::new(github),
            Arc::new(sandbox),
            config.workspace_settings(),
        ))
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.shared.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.shared.bus.subscribe()
    }

    /// Invoke `callback` with every snapshot of `key` until the subscription
    /// is dropped.
    pub fn on_state_change<F>(&self, key: SessionKey, callback: F) -> Subscription
    where
        F: FnMut(&SessionSnapshot) + Send + 'static,
    {
        self.shared.bus.on_state_change(key, callback)
    }

    pub fn snapshot(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        self.shared
            .lock()
            .snapshot(key)
            .ok_or_else(|| WorkspaceError::UnknownSession {
                key: key.to_string(),
            })
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let table = self.shared.lock();
        let mut sessions: Vec<SessionSnapshot> = table
            .entries
            .keys()
            .filter_map(|key| table.snapshot(key))
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Make `key` the active session, creating it if needed.
    ///
    /// The previously active session loses any unfinished branch acquisition.
    /// Its preview keeps running in the background; only the
    /// `max_background_previews` most recently active background sessions
    /// keep theirs, the rest are stopped and destroyed.
    pub fn activate(&self, key: &SessionKey) -> SessionSnapshot {
        let mut table = self.shared.lock();
        table.entry_or_insert(key);
        table.touch(key);
        let was_active = table.is_active(key);
        let previous = table.active.replace(key.clone()).filter(|p| p != key);

        let mut touched = Vec::new();
        if !was_active {
            tracing::info!(key = %key, "session activated");
            touched.push(key.clone());
        }
        if let Some(previous) = previous.clone() {
            if let Some(entry) = table.entries.get_mut(&previous)
                && matches!(
                    entry.branch.state(),
                    BranchState::Requesting
                        | BranchState::Failed { .. }
                        | BranchState::AwaitingUserChoice { .. }
                )
            {
                tracing::info!(key = %previous, "canceling branch acquisition of inactive session");
                entry.branch.reset();
            }
            touched.push(previous);
        }

        let keep = self.shared.settings.max_background_previews;
        for (evicted, remote_id) in table.evict_background(keep) {
            tracing::info!(key = %evicted, keep, "stopping background preview");
            if let Some(remote_id) = remote_id {
                destroy_in_background(Arc::clone(&self.shared.sandbox), remote_id);
            }
            if !touched.contains(&evicted) {
                touched.push(evicted);
            }
        }

        // The session just switched away from stays listed until the next
        // switch, so a quick switch back finds it.
        for dropped in table.prune_idle(previous.as_ref()) {
            tracing::debug!(key = %dropped, "dropping idle session");
            touched.retain(|k| k != &dropped);
            self.shared.bus.publish_closed(dropped);
        }

        for touched_key in &touched {
            if let Some(snapshot) = table.snapshot(touched_key) {
                self.shared.bus.publish_state(snapshot);
            }
        }
        table
            .snapshot(key)
            .unwrap_or_else(|| SessionSnapshot {
                key: key.clone(),
                active: true,
                branch: BranchAcquisition::default().snapshot(),
                preview: None,
            })
    }

    /// Request the working branch. A no-op while a request is running or a
    /// branch is already held.
    pub fn acquire_branch(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        let timeout = self.shared.settings.create_timeout;
        let mut generation = None;
        let snapshot = self.shared.command(key, true, |entry| {
            generation = entry.branch.begin(Utc::now(), timeout);
            Ok(generation.is_some())
        })?;
        match generation {
            Some(generation) => start_acquisition(&self.shared, key, generation),
            None => tracing::debug!(key = %key, "branch acquisition already in progress or done"),
        }
        Ok(snapshot)
    }

    pub fn select_existing_branch(
        &self,
        key: &SessionKey,
        branch: &str,
    ) -> Result<SessionSnapshot, WorkspaceError> {
        self.shared.command(key, false, |entry| {
            entry.branch.select(branch)?;
            tracing::info!(key = %key, branch, "existing branch selected");
            Ok(true)
        })
    }

    /// Abandon an unfinished branch acquisition.
    pub fn cancel(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        self.shared
            .command(key, false, |entry| entry.branch.cancel())
    }

    /// Forget the branch entirely so the next acquire starts fresh.
    pub fn reset_branch(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        self.shared.command(key, false, |entry| {
            if entry.branch.state() == &BranchState::Idle {
                return Ok(false);
            }
            entry.branch.reset();
            Ok(true)
        })
    }

    /// Launch a preview of `branch`, or of the acquired working branch when
    /// `branch` is `None`.
    ///
    /// Returns the existing preview unchanged when one for the same branch is
    /// launching, provisioning, running or errored. A preview of a different
    /// branch is stopped and replaced.
    pub fn start_preview(
        &self,
        key: &SessionKey,
        branch: Option<&str>,
    ) -> Result<SessionSnapshot, WorkspaceError> {
        let shared = &self.shared;
        shared.command(key, branch.is_some(), |entry| {
            let branch = match branch {
                Some(branch) => branch.to_string(),
                None => entry
                    .branch
                    .state()
                    .branch()
                    .map(str::to_string)
                    .ok_or_else(|| WorkspaceError::NoBranch {
                        key: key.to_string(),
                    })?,
            };

            if let Some(existing) = entry.preview.as_mut() {
                if existing.branch() == branch && existing.holds_sandbox() {
                    tracing::debug!(key = %key, branch = %branch, "preview already started");
                    return Ok(false);
                }
                if let (_, Some(remote_id)) = existing.stop() {
                    tracing::info!(key = %key, remote_id = %remote_id, "replacing preview");
                    destroy_in_background(Arc::clone(&shared.sandbox), remote_id);
                }
            }

            entry.preview_epoch += 1;
            let session = PreviewSession::launching(key, &branch, entry.preview_epoch);
            start_launch(shared, key, &session);
            entry.preview = Some(session);
            Ok(true)
        })
    }

    /// Stop the preview and destroy its sandbox in the background.
    pub fn stop_preview(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        let sandbox = &self.shared.sandbox;
        self.shared.command(key, false, |entry| {
            let (changed, remote_id) = entry.stop_preview();
            if let Some(remote_id) = remote_id {
                destroy_in_background(Arc::clone(sandbox), remote_id);
            }
            Ok(changed)
        })
    }

    /// Ask consumers to reload the running preview. No provisioning happens.
    pub fn refresh(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        let bus = &self.shared.bus;
        self.shared.command(key, false, |entry| {
            let url = entry
                .preview
                .as_ref()
                .and_then(|p| p.state().url())
                .ok_or_else(|| WorkspaceError::PreviewNotRunning {
                    key: key.to_string(),
                })?;
            bus.publish_refresh(key.clone(), url.to_string());
            Ok(false)
        })
    }

    /// Return an errored or stopped preview to `NotStarted`.
    pub fn reset_preview(&self, key: &SessionKey) -> Result<SessionSnapshot, WorkspaceError> {
        let sandbox = &self.shared.sandbox;
        self.shared.command(key, false, |entry| {
            let Some(preview) = entry.preview.as_mut() else {
                return Ok(false);
            };
            if preview.state() == &PreviewState::NotStarted {
                return Ok(false);
            }
            if let Some(remote_id) = preview.reset()? {
                destroy_in_background(Arc::clone(sandbox), remote_id);
            }
            Ok(true)
        })
    }

    /// Tear down one session: timers canceled, preview destroyed.
    pub fn close_session(&self, key: &SessionKey) -> Result<(), WorkspaceError> {
        let mut table = self.shared.lock();
        let mut entry = table
            .entries
            .remove(key)
            .ok_or_else(|| WorkspaceError::UnknownSession {
                key: key.to_string(),
            })?;
        table.recency.retain(|k| k != key);
        if table.is_active(key) {
            table.active = None;
        }

        entry.branch.teardown();
        if let (_, Some(remote_id)) = entry.stop_preview() {
            destroy_in_background(Arc::clone(&self.shared.sandbox), remote_id);
        }
        tracing::info!(key = %key, "session closed");
        self.shared.bus.publish_closed(key.clone());
        Ok(())
    }

    /// Close every session and wait for sandbox teardown. Returns the number
    /// of sandboxes a destroy was attempted for.
    pub async fn shutdown(&self) -> usize {
        let remote_ids: Vec<String> = {
            let mut table = self.shared.lock();
            table.active = None;
            table.recency.clear();
            let entries: Vec<(SessionKey, SessionEntry)> = table.entries.drain().collect();
            entries
                .into_iter()
                .filter_map(|(key, mut entry)| {
                    entry.branch.teardown();
                    let (_, remote_id) = entry.stop_preview();
                    self.shared.bus.publish_closed(key);
                    remote_id
                })
                .collect()
        };

        let sandbox = &self.shared.sandbox;
        let results = join_all(remote_ids.iter().map(|id| sandbox.destroy_instance(id))).await;
        for (remote_id, result) in remote_ids.iter().zip(&results) {
            if let Err(e) = result {
                tracing::warn!(remote_id = %remote_id, error = %e, "failed to destroy preview on shutdown");
            }
        }
        tracing::info!(destroyed = remote_ids.len(), "workspace shut down");
        remote_ids.len()
    }

    /// Wait until the branch acquisition for `key` needs nothing further
    /// without user input. Returns the settled state: `Succeeded` for the
    /// file-loading path, otherwise the state blocking it.
    pub async fn wait_for_branch(&self, key: &SessionKey) -> Result<BranchState, WorkspaceError> {
        let mut rx = self.subscribe();
        let current = self.snapshot(key)?;
        if current.branch.is_settled() {
            return Ok(current.branch.state);
        }
        loop {
            match rx.recv().await {
                Ok(WorkspaceEvent::StateChanged { snapshot, .. })
                    if snapshot.key == *key && snapshot.branch.is_settled() =>
                {
                    return Ok(snapshot.branch.state);
                }
                Ok(WorkspaceEvent::SessionClosed { key: closed, .. }) if closed == *key => {
                    return Err(WorkspaceError::UnknownSession {
                        key: key.to_string(),
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let current = self.snapshot(key)?;
                    if current.branch.is_settled() {
                        return Ok(current.branch.state);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.snapshot(key).map(|s| s.branch.state);
                }
            }
        }
    }
}
