//! Control/coordination spine for a GitHub-issue-queue-driven autonomous
//! coding worker fleet.
//!
//! This crate implements components C1-C11: the redactor, the durable-store
//! trait boundary, the in-process event bus, the rate-aware GitHub client,
//! the per-issue label write coordinator, the marker-keyed writeback engine,
//! the issue mirror poller, the pure queue-state engine, the per-worker
//! checkpoint runtime, the done reconciler, and the authenticated control
//! plane server. Everything outside this spine — the shell CLI, config
//! loading, the embedded coding agent, git worktree mechanics, the durable
//! database engine itself, and the dashboard UI — is an external
//! collaborator the crate only reaches through the narrow trait seams in
//! [`store`] and [`github::client::TokenProvider`].

pub mod bus;
pub mod checkpoint;
pub mod control_plane;
pub mod event;
pub mod github;
pub mod labels;
pub mod mirror;
pub mod persistence;
pub mod queue;
pub mod reconciler;
pub mod redact;
pub mod store;
pub mod writeback;
