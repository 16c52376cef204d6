//! Label Write Coordinator.
//!
//! `sipag-core` has nothing like this — `GhCliGateway::transition_label`
//! (`worker/github_gateway.rs`) is a fire-and-forget remove-then-add with no
//! locking, no coalescing, and no backoff, because `sipag` only ever has one
//! worker touching one issue at a time. Driving many concurrent workers
//! across many repos needs the per-issue lock map this module adds — built
//! in the same "lazily-created, mutex-guarded `HashMap`" shape `EventBus`
//! already uses for its subscriber table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::github::{ErrorKind, GitHubApiError, GitHubClient, GitHubRequest};
use crate::store::{RepoLabelWriteState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelOp {
    pub action: LabelAction,
    pub label: String,
}

impl LabelOp {
    pub fn add(label: impl Into<String>) -> Self {
        Self { action: LabelAction::Add, label: label.into() }
    }

    pub fn remove(label: impl Into<String>) -> Self {
        Self { action: LabelAction::Remove, label: label.into() }
    }

    fn is_ralph_status(&self) -> bool {
        self.label.starts_with("ralph:status:")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    BestEffort,
    Critical,
}

pub struct ExecuteLabelOpsRequest {
    pub repo: String,
    pub issue_number: u64,
    pub ops: Vec<LabelOp>,
    pub write_class: WriteClass,
    pub allow_non_ralph: bool,
    /// Hint for the single-status-invariant heal.
    pub desired_status_hint: Option<String>,
    /// Whether this issue currently has an active worker op-state, used to
    /// infer a heal target when no valid hint is supplied.
    pub has_active_op_state: bool,
    pub coalesce_window: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LabelOpsError {
    #[error("label op refused by policy: {0}")]
    Policy(String),
    #[error(transparent)]
    Transient(GitHubApiError),
    #[error(transparent)]
    Auth(GitHubApiError),
    #[error(transparent)]
    Unknown(GitHubApiError),
}

impl From<GitHubApiError> for LabelOpsError {
    fn from(err: GitHubApiError) -> Self {
        match err.code {
            ErrorKind::Transient => LabelOpsError::Transient(err),
            ErrorKind::Auth => LabelOpsError::Auth(err),
            ErrorKind::MissingLabel | ErrorKind::Unknown => LabelOpsError::Unknown(err),
        }
    }
}

struct PendingBatch {
    ops: Vec<LabelOp>,
    waiters: Vec<oneshot::Sender<Result<(), LabelOpsError>>>,
}

/// Coordinates all label mutations so that, per `repo#issueNumber`, writes
/// are totally ordered and the `ralph:status:*` single-status invariant
/// holds after every call that touches a status label.
pub struct LabelCoordinator {
    github: Arc<GitHubClient>,
    store: Arc<dyn StateStore>,
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    pending: std::sync::Mutex<HashMap<String, PendingBatch>>,
}

impl LabelCoordinator {
    pub fn new(github: Arc<GitHubClient>, store: Arc<dyn StateStore>) -> Self {
        Self {
            github,
            store,
            locks: AsyncMutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn issue_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Public entry point.
    pub async fn execute(self: &Arc<Self>, req: ExecuteLabelOpsRequest) -> Result<(), LabelOpsError> {
        check_policy(&req.ops, req.allow_non_ralph)?;

        let key = format!("{}#{}", req.repo, req.issue_number);
        let has_cmd_label = req.ops.iter().any(|op| op.label.starts_with("ralph:cmd:"));
        let coalesces = req.write_class == WriteClass::BestEffort && !has_cmd_label;

        if !coalesces {
            return self.clone().apply_locked(&key, req).await;
        }

        let (rx, should_spawn) = {
            let mut pending = self.pending.lock().expect("label pending map poisoned");
            let (tx, rx) = oneshot::channel();
            match pending.get_mut(&key) {
                Some(batch) => {
                    batch.ops = merge_coalesced_ops(std::mem::take(&mut batch.ops), req.ops.clone());
                    batch.waiters.push(tx);
                    (rx, false)
                }
                None => {
                    pending.insert(key.clone(), PendingBatch { ops: req.ops.clone(), waiters: vec![tx] });
                    (rx, true)
                }
            }
        };

        if should_spawn {
            let this = self.clone();
            let key_for_task = key.clone();
            let window = req.coalesce_window;
            let repo = req.repo.clone();
            let issue_number = req.issue_number;
            let allow_non_ralph = req.allow_non_ralph;
            let desired_status_hint = req.desired_status_hint.clone();
            let has_active_op_state = req.has_active_op_state;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let batch = {
                    let mut pending = this.pending.lock().expect("label pending map poisoned");
                    pending.remove(&key_for_task)
                };
                let Some(batch) = batch else { return };
                let flush_req = ExecuteLabelOpsRequest {
                    repo,
                    issue_number,
                    ops: batch.ops,
                    write_class: WriteClass::BestEffort,
                    allow_non_ralph,
                    desired_status_hint,
                    has_active_op_state,
                    coalesce_window: window,
                };
                let result = this.clone().apply_locked(&key_for_task, flush_req).await;
                for waiter in batch.waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        rx.await.unwrap_or(Err(LabelOpsError::Unknown(GitHubApiError::new(0, "coalesce task dropped".into()))))
    }

    async fn apply_locked(self: Arc<Self>, key: &str, req: ExecuteLabelOpsRequest) -> Result<(), LabelOpsError> {
        let lock = self.issue_lock(key).await;
        let _guard = lock.lock().await;

        let backoff_state = self.store.get_repo_label_write_state(&req.repo).await.unwrap_or_default();
        let in_backoff = backoff_state.blocked_until.is_some_and(|until| until > chrono::Utc::now());
        if in_backoff && req.write_class == WriteClass::BestEffort {
            return Err(LabelOpsError::Transient(GitHubApiError::new(
                0,
                format!("repo {} is in label-write backoff", req.repo),
            )));
        }

        let touched_status = req.ops.iter().any(LabelOp::is_ralph_status);
        let retried = self.apply_ops_with_retry(&req.repo, req.issue_number, req.ops.clone()).await;

        match retried {
            Ok(()) => {
                if touched_status && !in_backoff {
                    self.heal_single_status(&req.repo, req.issue_number, req.desired_status_hint.as_deref(), req.has_active_op_state)
                        .await;
                }
                Ok(())
            }
            Err(LabelOpsError::Transient(err)) => {
                self.bump_backoff(&req.repo, backoff_state).await;
                Err(LabelOpsError::Transient(err))
            }
            Err(other) => Err(other),
        }
    }

    /// Apply adds (single multi-label POST) then removes (sequential
    /// DELETE), rolling back applied steps in reverse on a non-transient
    /// failure, with one missing-label retry
    /// (point 5).
    async fn apply_ops_with_retry(&self, repo: &str, issue_number: u64, ops: Vec<LabelOp>) -> Result<(), LabelOpsError> {
        match self.apply_ops_once(repo, issue_number, ops.clone()).await {
            Err(LabelOpsError::Unknown(err)) if err.code == ErrorKind::MissingLabel => {
                self.ensure_labels(repo, &ops).await;
                self.apply_ops_once(repo, issue_number, ops).await
            }
            other => other,
        }
    }

    async fn apply_ops_once(&self, repo: &str, issue_number: u64, ops: Vec<LabelOp>) -> Result<(), LabelOpsError> {
        let live = self.list_labels(repo, issue_number).await.unwrap_or_default();
        let ops = trim_noop_ops(ops, &live);

        let adds: Vec<String> = ops.iter().filter(|o| o.action == LabelAction::Add).map(|o| o.label.clone()).collect();
        let removes: Vec<String> = ops.iter().filter(|o| o.action == LabelAction::Remove).map(|o| o.label.clone()).collect();

        let mut applied_adds = Vec::new();
        if !adds.is_empty() {
            match self
                .github
                .request(
                    GitHubRequest {
                        method: reqwest::Method::POST,
                        path: &format!("/repos/{repo}/issues/{issue_number}/labels"),
                        body: Some(json!({ "labels": adds })),
                        allow_not_found: false,
                        source: Some("labels.apply.add"),
                    },
                )
                .await
            {
                Ok(_) => applied_adds = adds,
                Err(err) => return Err(err.into()),
            }
        }

        let mut applied_removes = Vec::new();
        for label in &removes {
            let encoded = urlencoding_label(label);
            match self
                .github
                .request(GitHubRequest {
                    method: reqwest::Method::DELETE,
                    path: &format!("/repos/{repo}/issues/{issue_number}/labels/{encoded}"),
                    body: None,
                    allow_not_found: true,
                    source: Some("labels.apply.remove"),
                })
                .await
            {
                Ok(_) => applied_removes.push(label.clone()),
                Err(err) => {
                    let classified: LabelOpsError = err.into();
                    if matches!(classified, LabelOpsError::Transient(_)) {
                        return Err(classified);
                    }
                    self.rollback(repo, issue_number, &applied_adds, &applied_removes).await;
                    return Err(classified);
                }
            }
        }

        Ok(())
    }

    async fn rollback(&self, repo: &str, issue_number: u64, applied_adds: &[String], applied_removes: &[String]) {
        warn!(repo, issue_number, "rolling back partially applied label ops");
        for label in applied_adds.iter().rev() {
            let encoded = urlencoding_label(label);
            let _ = self
                .github
                .request(GitHubRequest {
                    method: reqwest::Method::DELETE,
                    path: &format!("/repos/{repo}/issues/{issue_number}/labels/{encoded}"),
                    body: None,
                    allow_not_found: true,
                    source: Some("labels.rollback"),
                })
                .await;
        }
        for label in applied_removes.iter().rev() {
            let _ = self
                .github
                .request(
                    GitHubRequest {
                        method: reqwest::Method::POST,
                        path: &format!("/repos/{repo}/issues/{issue_number}/labels"),
                        body: Some(json!({ "labels": [label] })),
                        allow_not_found: false,
                        source: Some("labels.rollback"),
                    },
                )
                .await;
        }
    }

    /// Ensure every Ralph workflow label exists on `repo`. Memoization and the retry schedule live in the caller
    /// (C10); this just performs one best-effort create-if-missing pass.
    pub async fn ensure_ralph_workflow_labels(&self, repo: &str) {
        let ops: Vec<LabelOp> =
            crate::queue::ALL_RALPH_WORKFLOW_LABELS.iter().map(|l| LabelOp::add(*l)).collect();
        self.ensure_labels(repo, &ops).await;
    }

    async fn ensure_labels(&self, repo: &str, ops: &[LabelOp]) {
        for op in ops.iter().filter(|o| o.action == LabelAction::Add) {
            let _ = self
                .github
                .request(GitHubRequest {
                    method: reqwest::Method::POST,
                    path: &format!("/repos/{repo}/labels"),
                    body: Some(json!({ "name": op.label, "color": "ededed" })),
                    allow_not_found: false,
                    source: Some("labels.ensure"),
                })
                .await;
        }
    }

    async fn list_labels(&self, repo: &str, issue_number: u64) -> Result<HashSet<String>, LabelOpsError> {
        let resp = self
            .github
            .request(GitHubRequest::get(&format!("/repos/{repo}/issues/{issue_number}/labels")))
            .await?;
        Ok(resp
            .data
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.get("name").and_then(|n| n.as_str()).map(String::from)).collect())
            .unwrap_or_default())
    }

    async fn heal_single_status(&self, repo: &str, issue_number: u64, hint: Option<&str>, has_active_op_state: bool) {
        let Ok(live) = self.list_labels(repo, issue_number).await else { return };
        let status_labels: Vec<String> = live.iter().filter(|l| l.starts_with("ralph:status:")).cloned().collect();
        if status_labels.len() == 1 {
            return;
        }
        let target = pick_status_heal_target(&status_labels, hint, has_active_op_state);
        info!(repo, issue_number, target, current = status_labels.len(), "healing single-status invariant");

        if !status_labels.contains(&target) {
            let _ = self
                .github
                .request(GitHubRequest {
                    method: reqwest::Method::POST,
                    path: &format!("/repos/{repo}/issues/{issue_number}/labels"),
                    body: Some(json!({ "labels": [target] })),
                    allow_not_found: false,
                    source: Some("labels.heal"),
                })
                .await;
        }
        for other in status_labels.iter().filter(|l| *l != &target) {
            let encoded = urlencoding_label(other);
            let _ = self
                .github
                .request(GitHubRequest {
                    method: reqwest::Method::DELETE,
                    path: &format!("/repos/{repo}/issues/{issue_number}/labels/{encoded}"),
                    body: None,
                    allow_not_found: true,
                    source: Some("labels.heal"),
                })
                .await;
        }
    }

    async fn bump_backoff(&self, repo: &str, mut state: RepoLabelWriteState) {
        state.consecutive_failures += 1;
        let backoff = next_backoff(state.consecutive_failures);
        state.blocked_until = Some(chrono::Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero()));
        let _ = self.store.set_repo_label_write_state(repo, state).await;
    }
}

fn urlencoding_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

fn check_policy(ops: &[LabelOp], allow_non_ralph: bool) -> Result<(), LabelOpsError> {
    if allow_non_ralph {
        return Ok(());
    }
    for op in ops {
        if !op.label.starts_with("ralph:") {
            return Err(LabelOpsError::Policy(format!("non-ralph label {} requires allowNonRalph", op.label)));
        }
    }
    Ok(())
}

/// Merge a newly-arrived op set into a pending coalesced batch: add wins
/// over remove on conflict for the same label, and each label keeps only
/// its most recent action otherwise.
fn merge_coalesced_ops(existing: Vec<LabelOp>, incoming: Vec<LabelOp>) -> Vec<LabelOp> {
    let mut by_label: HashMap<String, LabelAction> = HashMap::new();
    for op in existing.into_iter().chain(incoming) {
        by_label
            .entry(op.label.clone())
            .and_modify(|a| {
                if op.action == LabelAction::Add {
                    *a = LabelAction::Add;
                } else if *a != LabelAction::Add {
                    *a = op.action;
                }
            })
            .or_insert(op.action);
    }
    by_label.into_iter().map(|(label, action)| LabelOp { action, label }).collect()
}

/// Drop ops that would be no-ops against the current live label set.
fn trim_noop_ops(ops: Vec<LabelOp>, live: &HashSet<String>) -> Vec<LabelOp> {
    ops.into_iter()
        .filter(|op| match op.action {
            LabelAction::Add => !live.contains(&op.label),
            LabelAction::Remove => live.contains(&op.label),
        })
        .collect()
}

/// Pick the surviving `ralph:status:*` label when the invariant is broken:
/// the hint if it is itself a valid status label, else infer `in-progress`
/// when an op-state is active, else fall back to `queued`.
fn pick_status_heal_target(current: &[String], hint: Option<&str>, has_active_op_state: bool) -> String {
    if let Some(hint) = hint {
        if hint.starts_with("ralph:status:") {
            return hint.to_string();
        }
    }
    if has_active_op_state {
        return "ralph:status:in-progress".to_string();
    }
    current
        .iter()
        .find(|l| l.as_str() == "ralph:status:queued")
        .cloned()
        .unwrap_or_else(|| "ralph:status:queued".to_string())
}

/// Doubling backoff with a 30s floor and 30min ceiling.
fn next_backoff(consecutive_failures: u32) -> Duration {
    let secs = 30u64.saturating_mul(1u64 << consecutive_failures.min(6));
    Duration::from_secs(secs.min(30 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_rejects_non_ralph_label_unless_allowed() {
        let ops = vec![LabelOp::add("bug")];
        assert!(check_policy(&ops, false).is_err());
        assert!(check_policy(&ops, true).is_ok());
    }

    #[test]
    fn merge_prefers_add_over_remove_on_conflict() {
        let existing = vec![LabelOp::remove("ralph:status:queued")];
        let incoming = vec![LabelOp::add("ralph:status:queued")];
        let merged = merge_coalesced_ops(existing, incoming);
        assert_eq!(merged, vec![LabelOp::add("ralph:status:queued")]);
    }

    #[test]
    fn trim_noop_drops_add_of_already_present_label() {
        let live = HashSet::from(["ralph:status:queued".to_string()]);
        let ops = vec![LabelOp::add("ralph:status:queued"), LabelOp::add("ralph:status:in-progress")];
        let trimmed = trim_noop_ops(ops, &live);
        assert_eq!(trimmed, vec![LabelOp::add("ralph:status:in-progress")]);
    }

    #[test]
    fn trim_noop_drops_remove_of_absent_label() {
        let live = HashSet::new();
        let ops = vec![LabelOp::remove("ralph:status:queued")];
        assert!(trim_noop_ops(ops, &live).is_empty());
    }

    #[test]
    fn heal_target_prefers_valid_hint() {
        let current = vec!["ralph:status:queued".to_string(), "ralph:status:in-progress".to_string()];
        assert_eq!(
            pick_status_heal_target(&current, Some("ralph:status:blocked"), false),
            "ralph:status:blocked"
        );
    }

    #[test]
    fn heal_target_infers_in_progress_from_active_op_state_when_hint_invalid() {
        let current = vec!["ralph:status:queued".to_string(), "ralph:status:done".to_string()];
        assert_eq!(pick_status_heal_target(&current, None, true), "ralph:status:in-progress");
    }

    #[test]
    fn heal_target_falls_back_to_queued() {
        let current = vec!["ralph:status:done".to_string()];
        assert_eq!(pick_status_heal_target(&current, None, false), "ralph:status:queued");
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        assert_eq!(next_backoff(0), Duration::from_secs(30));
        assert_eq!(next_backoff(1), Duration::from_secs(60));
        assert_eq!(next_backoff(10), Duration::from_secs(30 * 60));
    }

    #[test]
    fn urlencoding_escapes_colons_in_label_names() {
        assert_eq!(urlencoding_label("ralph:status:queued"), "ralph%3Astatus%3Aqueued");
    }
}
