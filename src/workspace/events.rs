//! The single event stream consumers observe.
//!
//! Every transition the orchestrator applies is published here as a full
//! [`SessionSnapshot`], tagged with a process-wide sequence number. Events are
//! published while the session table lock is held, so `seq` order matches the
//! order transitions were applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::models::{SessionKey, SessionSnapshot};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkspaceEvent {
    StateChanged {
        seq: u64,
        snapshot: SessionSnapshot,
    },
    /// Reload the preview frame; no provisioning happens.
    PreviewRefresh {
        seq: u64,
        key: SessionKey,
        url: String,
    },
    SessionClosed {
        seq: u64,
        key: SessionKey,
    },
}

impl WorkspaceEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::StateChanged { seq, .. }
            | Self::PreviewRefresh { seq, .. }
            | Self::SessionClosed { seq, .. } => *seq,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkspaceEvent>,
    seq: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.tx.subscribe()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn send(&self, event: WorkspaceEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.tx.send(event);
    }

    pub(crate) fn publish_state(&self, snapshot: SessionSnapshot) {
        tracing::debug!(
            key = %snapshot.key,
            branch_state = snapshot.branch.state.as_str(),
            preview_state = snapshot.preview.as_ref().map(|p| p.state.as_str()),
            "state changed"
        );
        let seq = self.next_seq();
        self.send(WorkspaceEvent::StateChanged { seq, snapshot });
    }

    pub(crate) fn publish_refresh(&self, key: SessionKey, url: String) {
        let seq = self.next_seq();
        self.send(WorkspaceEvent::PreviewRefresh { seq, key, url });
    }

    pub(crate) fn publish_closed(&self, key: SessionKey) {
        let seq = self.next_seq();
        self.send(WorkspaceEvent::SessionClosed { seq, key });
    }

    /// Deliver every snapshot for `key` to `callback` until the returned
    /// [`Subscription`] is dropped.
    pub fn on_state_change<F>(&self, key: SessionKey, mut callback: F) -> Subscription
    where
        F: FnMut(&SessionSnapshot) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(WorkspaceEvent::StateChanged { snapshot, .. }) if snapshot.key == key => {
                        callback(&snapshot);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(key = %key, missed, "state subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

/// Stops the callback task when dropped.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::models::{BranchSnapshot, BranchState};
    use std::sync::Mutex;
    use std::time::Duration;

    fn snapshot(project: &str, state: BranchState) -> SessionSnapshot {
        SessionSnapshot {
            key: SessionKey::new(project, "acme", "site"),
            active: true,
            branch: BranchSnapshot {
                state,
                slow: false,
                create_pending: false,
                fetching_existing: false,
                attempt_started_at: None,
                timeout_at: None,
            },
            preview: None,
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = WorkspaceEvent::PreviewRefresh {
            seq: 7,
            key: SessionKey::new("p1", "acme", "site"),
            url: "https://x".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"PreviewRefresh\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"seq\":7"));
    }

    #[tokio::test]
    async fn test_seq_is_monotonic() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish_state(snapshot("p1", BranchState::Idle));
        bus.publish_state(snapshot("p1", BranchState::Requesting));
        bus.publish_closed(SessionKey::new("p1", "acme", "site"));

        let seqs: Vec<u64> = vec![
            rx.recv().await.unwrap().seq(),
            rx.recv().await.unwrap().seq(),
            rx.recv().await.unwrap().seq(),
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_on_state_change_filters_by_key() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on_state_change(SessionKey::new("p1", "acme", "site"), move |s| {
            sink.lock().unwrap().push(s.branch.state.as_str());
        });

        bus.publish_state(snapshot("p2", BranchState::Requesting));
        bus.publish_state(snapshot("p1", BranchState::Requesting));
        bus.publish_state(snapshot(
            "p1",
            BranchState::Succeeded {
                branch: "roseram/p1".into(),
            },
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["requesting", "succeeded"]);
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_callbacks() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let sub = bus.on_state_change(SessionKey::new("p1", "acme", "site"), move |_| {
            *sink.lock().unwrap() += 1;
        });
        drop(sub);
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.publish_state(snapshot("p1", BranchState::Requesting));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
