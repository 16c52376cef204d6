//! Durable state store interface.
//!
//! The durable store's actual implementation is an external collaborator
//! — the core only owns this narrow trait boundary, in the
//! same spirit as `sipag-core`'s `worker::ports::{StateStore, ContainerRuntime,
//! GitHubGateway}` traits that let `sipag-core`'s orchestration functions
//! stay pure and swap `FileStateStore`/`GhCliGateway` for test doubles.
//! [`memory::InMemoryStore`] is the reference implementation used by the
//! rest of this crate's tests and by `orchestrator-cli`'s demo scheduler —
//! it is not "the" production database, any more than `FileStateStore` was
//! meant to be `sipag`'s final word on persistence.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Failure modes a durable store can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store schema is newer than this build supports")]
    ForwardIncompatible,
    #[error("timed out waiting for a store lock")]
    LockTimeout,
    #[error("store operation failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootstrapCursor {
    pub next_url: Option<String>,
    pub high_watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DoneReconcileCursor {
    pub last_merged_at: Option<DateTime<Utc>>,
    pub last_pr_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncCursor {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub bootstrap: Option<BootstrapCursor>,
    pub done_reconcile: DoneReconcileCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueSnapshot {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub state: IssueState,
    pub labels: HashSet<String>,
    pub github_node_id: String,
    pub github_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpState {
    pub repo: String,
    pub issue_number: u64,
    pub task_path: String,
    pub session_id: Option<String>,
    pub status: String,
    pub heartbeat_at: DateTime<Utc>,
    pub released_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepoLabelWriteState {
    pub blocked_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Set on a repo by C7 when it finds pre-vNext workflow labels on an open
/// issue. Downstream reconcilers
/// (C8/C10) must treat a repo carrying this as off-limits until an operator
/// clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLabelSchemeError {
    pub detected_at: DateTime<Utc>,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A transaction handle. All mutations that must be atomic with each other
/// (e.g. one page of issue ingestion: snapshot + labels-snapshot + cursor
/// advance) go through the same transaction — every operation that mutates
/// durable state runs inside exactly one transaction per operation group.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn record_issue_snapshot(&mut self, snapshot: IssueSnapshot) -> Result<(), StoreError>;
    async fn record_issue_labels_snapshot(
        &mut self,
        repo: &str,
        issue_number: u64,
        labels: HashSet<String>,
    ) -> Result<(), StoreError>;
    async fn record_repo_issue_sync(&mut self, repo: &str, last_sync_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn record_repo_issue_bootstrap_cursor(
        &mut self,
        repo: &str,
        cursor: BootstrapCursor,
    ) -> Result<(), StoreError>;
    async fn clear_repo_issue_bootstrap_cursor(&mut self, repo: &str) -> Result<(), StoreError>;
    async fn record_repo_done_reconcile_cursor(
        &mut self,
        repo: &str,
        cursor: DoneReconcileCursor,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The durable key/value + tabular store the core consumes.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    // Idempotency keys — the cross-process coordination primitive for
    // writeback de-duplication.
    async fn has_key(&self, key: &str) -> Result<bool, StoreError>;
    async fn record_key_if_absent(
        &self,
        key: &str,
        scope: &str,
        payload: Option<Value>,
    ) -> Result<bool, StoreError>;
    async fn upsert_key(&self, key: &str, scope: &str, payload: Option<Value>) -> Result<(), StoreError>;
    async fn get_payload(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn delete_key(&self, key: &str) -> Result<(), StoreError>;

    // Cursors
    async fn get_repo_issue_sync_cursor(&self, repo: &str) -> Result<SyncCursor, StoreError>;

    // Snapshots
    async fn has_issue_snapshot(&self, repo: &str, issue_number: u64) -> Result<bool, StoreError>;
    async fn get_issue_labels(&self, repo: &str, issue_number: u64) -> Result<Option<HashSet<String>>, StoreError>;

    // Op-state
    async fn list_task_op_states_by_repo(&self, repo: &str) -> Result<Vec<OpState>, StoreError>;

    // Label write backoff
    async fn get_repo_label_write_state(&self, repo: &str) -> Result<RepoLabelWriteState, StoreError>;
    async fn set_repo_label_write_state(&self, repo: &str, state: RepoLabelWriteState) -> Result<(), StoreError>;

    // Legacy label-scheme detection
    async fn get_repo_legacy_label_scheme_error(
        &self,
        repo: &str,
    ) -> Result<Option<LegacyLabelSchemeError>, StoreError>;
    async fn set_repo_legacy_label_scheme_error(
        &self,
        repo: &str,
        error: Option<LegacyLabelSchemeError>,
    ) -> Result<(), StoreError>;

    // Runs
    async fn create_run(&self, repo: &str, issue_number: u64) -> Result<String, StoreError>;
    async fn record_run_token_totals(&self, run_id: &str, totals: TokenTotals) -> Result<(), StoreError>;
    async fn record_run_session_use(&self, run_id: &str, session_id: &str) -> Result<(), StoreError>;
    async fn record_run_trace_pointer(&self, run_id: &str, path: &str) -> Result<(), StoreError>;
}
