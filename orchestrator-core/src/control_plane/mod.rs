//! Authenticated HTTP+WebSocket control plane.
//!
//! `sipag-core` has no always-on server — `sipag` is a one-shot CLI launcher.
//! This module is grounded instead in other axum services
//! (`adamtc007-ob-poc`'s `sem_os_server::router`/`middleware::jwt` for the
//! route/auth-layer split, `prospectorengine-prospector-btc`'s
//! `handlers::stream` for the WebSocket replay-then-live shape) and wired
//! into the bus/event types already established by [`crate::bus`] and
//! [`crate::event`]. It never talks to the `StateStore` or `GitHubClient`
//! directly: the snapshot it serves and the commands it dispatches are both
//! narrow trait seams the scheduler
//! fills in.

pub mod auth;
pub mod commands;
pub mod error;
pub mod handlers;
pub mod server;

pub use commands::{
    CommandHandlers, CommandOutcome, IssueCmdRequest, IssuePriorityRequest, MessageEnqueueRequest,
    TaskPriorityRequest, TaskStatusRequest, WorkerTarget,
};
pub use error::ControlPlaneError;
pub use server::{build_router, ControlPlaneConfig, ControlPlaneState, SnapshotProvider};
