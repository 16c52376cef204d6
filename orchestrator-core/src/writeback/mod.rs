//! Writeback Engine: marker-keyed, idempotent GitHub
//! comment create/patch/noop shared by escalation, watchdog, rollup-ready,
//! parent-verification, and merge-conflict writebacks.
//!
//! `sipag-core` has nothing like this either — `GhCliGateway::post_comment`
//! (`worker/github_gateway.rs`) always creates a new comment, because
//! `sipag` never needs to recognize "the same" comment across runs. This
//! module's marker+idempotency-key pattern is new territory: the GitHub
//! comment itself is treated as the source-of-truth replica of the
//! idempotency key, not the state store's copy of it.

pub mod engine;
pub mod escalation;
pub mod marker;
pub mod merge_conflict;
pub mod parent_verify;
pub mod rollup;
pub mod watchdog;

pub use engine::{apply_writeback, CommentAction, WritebackContext, WritebackError, WritebackOutcome, WritebackPlan};
