//! Workspace orchestration: working branches and preview sandboxes.
//!
//! ## Overview
//!
//! Each workspace is identified by a [`models::SessionKey`] (project + GitHub
//! repository). For every key the orchestrator acquires a writable working
//! branch, falling back to a picker of existing branches when creation fails
//! or stalls, and runs at most one preview sandbox that is polled until it
//! serves a URL.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │   (UI)   │ <─────── │    ├─ api.rs  (command handlers, AppState)       │
//! └──────────┘ WebSocket│    └─ ws.rs   (event stream, ping/pong)          │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (session table, Shared)        │
//!                       │    ├─ branch.rs   (acquisition state machine)    │
//!                       │    │     └─ github.rs  (BranchService trait)     │
//!                       │    ├─ preview.rs  (provisioning state machine)   │
//!                       │    │     └─ sandbox.rs (SandboxService trait)    │
//!                       │    └─ events.rs   (broadcast bus, seq numbers)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `SessionKey`, branch/preview states, snapshots, `slugify`   |
//! | `timer`   | `TimerHandle` and `poll_until`, shared by both machines     |
//!
//! ## Typical Flow
//!
//! 1. `POST /api/sessions/activate` makes a key active; the previous key's
//!    unfinished branch acquisition is canceled.
//! 2. `POST /api/sessions/branch/acquire` resolves the default branch and
//!    creates `<prefix>/<project>`. After the grace period the existing
//!    branches are listed so the UI can offer them while creation continues.
//! 3. `POST /api/sessions/preview/start` creates a sandbox for the branch and
//!    polls its status every `poll_interval` until it runs, errors, or the
//!    attempt/time budget runs out.
//! 4. Every transition is published on `/ws` as a full session snapshot.

pub mod api;
pub mod branch;
pub mod events;
pub mod github;
pub mod models;
pub mod orchestrator;
pub mod preview;
pub mod sandbox;
pub mod server;
pub mod timer;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;

pub use events::{Subscription, WorkspaceEvent};
pub use models::{BranchState, PreviewState, SessionKey, SessionSnapshot};
pub use orchestrator::{Orchestrator, WorkspaceSettings};
