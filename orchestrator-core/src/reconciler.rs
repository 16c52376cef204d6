//! Done Reconciler: periodic per-repo sweep of merged
//! PRs, labeling their linked issues `ralph:done`.
//!
//! `sipag-core`'s `worker::github::reconcile_merged_prs` (`worker/github.rs`)
//! does the REST equivalent of this for a single repo with no cursor, no
//! pagination, and no backoff, because `sipag` re-derives "which PRs merged"
//! from a fresh `gh pr list --state merged` every cycle. Running this across
//! many repos on a budget needs the cursor + GraphQL search this module
//! adds; the query shape mirrors `writeback::engine`'s `COMMENTS_QUERY`, and
//! label application is delegated entirely to [`crate::labels::LabelCoordinator`]
//! rather than reimplemented here.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::github::{GitHubApiError, GitHubClient, GitHubRequest};
use crate::labels::{ExecuteLabelOpsRequest, LabelCoordinator, LabelOp, WriteClass};
use crate::queue::ALL_STATUS_LABELS;
use crate::store::{DoneReconcileCursor, StateStore, StoreError};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_prs_per_run: u32,
    pub default_branch_ttl: Duration,
    pub base_backoff: Duration,
    pub max_backoff_multiplier: u32,
    pub jitter_fraction: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_prs_per_run: 20,
            default_branch_ttl: Duration::from_secs(600),
            base_backoff: Duration::from_secs(15),
            max_backoff_multiplier: 10,
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    GitHub(#[from] GitHubApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStatus {
    Ok,
    SkippedNotAllowed,
    SkippedLegacyScheme,
    SkippedNoDefaultBranch,
    CursorInitialized,
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub repo: String,
    pub status: ReconcileStatus,
    pub prs_processed: usize,
    pub issues_labeled_done: usize,
    pub stopped_on_error: bool,
    pub next_delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MergedPr {
    number: u64,
    merged_at: DateTime<Utc>,
    closing_issues: Vec<ClosingIssue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ClosingIssue {
    repo: String,
    number: u64,
    is_open: bool,
    labels: HashSet<String>,
}

#[derive(Default, Clone, Copy)]
struct RepoBackoff {
    multiplier: u32,
}

pub struct DoneReconciler {
    github: std::sync::Arc<GitHubClient>,
    store: std::sync::Arc<dyn StateStore>,
    labels: std::sync::Arc<LabelCoordinator>,
    config: ReconcilerConfig,
    allowed_repos: Option<HashSet<String>>,
    default_branch_cache: StdMutex<HashMap<String, (String, Instant)>>,
    ensured_labels_for: StdMutex<HashSet<String>>,
    backoff: StdMutex<HashMap<String, RepoBackoff>>,
}

impl DoneReconciler {
    pub fn new(
        github: std::sync::Arc<GitHubClient>,
        store: std::sync::Arc<dyn StateStore>,
        labels: std::sync::Arc<LabelCoordinator>,
        config: ReconcilerConfig,
        allowed_repos: Option<HashSet<String>>,
    ) -> Self {
        Self {
            github,
            store,
            labels,
            config,
            allowed_repos,
            default_branch_cache: StdMutex::new(HashMap::new()),
            ensured_labels_for: StdMutex::new(HashSet::new()),
            backoff: StdMutex::new(HashMap::new()),
        }
    }

    fn is_allowed(&self, repo: &str) -> bool {
        match &self.allowed_repos {
            Some(set) => set.contains(repo),
            None => true,
        }
    }

    /// Run one reconcile tick for `repo`.
    pub async fn tick(&self, repo: &str) -> Result<ReconcileOutcome, ReconcilerError> {
        if !self.is_allowed(repo) {
            return Ok(self.done(repo, ReconcileStatus::SkippedNotAllowed, 0, 0, false));
        }
        if self.store.get_repo_legacy_label_scheme_error(repo).await?.is_some() {
            return Ok(self.done(repo, ReconcileStatus::SkippedLegacyScheme, 0, 0, false));
        }

        self.ensure_labels_once(repo).await;

        let cursor = self.store.get_repo_issue_sync_cursor(repo).await?.done_reconcile;
        let Some(last_merged_at) = cursor.last_merged_at else {
            let mut txn = self.store.begin_transaction().await?;
            txn.record_repo_done_reconcile_cursor(repo, DoneReconcileCursor { last_merged_at: Some(Utc::now()), last_pr_number: None }).await?;
            txn.commit().await?;
            return Ok(self.done(repo, ReconcileStatus::CursorInitialized, 0, 0, false));
        };
        let last_pr_number = cursor.last_pr_number.unwrap_or(0);

        let Some(default_branch) = self.resolve_default_branch(repo).await? else {
            return Ok(self.done(repo, ReconcileStatus::SkippedNoDefaultBranch, 0, 0, false));
        };

        let mut prs = self.search_merged_prs(repo, &default_branch, last_merged_at).await?;
        prs.sort_by(|a, b| a.merged_at.cmp(&b.merged_at).then(a.number.cmp(&b.number)));
        prs.retain(|pr| (pr.merged_at, pr.number) > (last_merged_at, last_pr_number));

        let mut processed = 0usize;
        let mut labeled = 0usize;
        let mut stopped_on_error = false;
        let mut advance_to: Option<(DateTime<Utc>, u64)> = None;

        for pr in prs.iter().take(self.config.max_prs_per_run as usize) {
            let mut pr_ok = true;
            for issue in &pr.closing_issues {
                if issue.repo != repo || !issue.is_open || !issue.labels.iter().any(|l| l.starts_with("ralph:")) {
                    continue;
                }
                let mut remove: Vec<LabelOp> = ALL_STATUS_LABELS.iter().map(|l| LabelOp::remove(*l)).collect();
                let mut ops = vec![LabelOp::add("ralph:done")];
                ops.append(&mut remove);

                let result = self
                    .labels
                    .execute(ExecuteLabelOpsRequest {
                        repo: repo.to_string(),
                        issue_number: issue.number,
                        ops,
                        write_class: WriteClass::Critical,
                        allow_non_ralph: true,
                        desired_status_hint: None,
                        has_active_op_state: false,
                        coalesce_window: Duration::from_millis(0),
                    })
                    .await;

                match result {
                    Ok(()) => labeled += 1,
                    Err(err) => {
                        warn!(repo, pr = pr.number, issue = issue.number, %err, "done reconcile label write failed; halting cursor advance");
                        pr_ok = false;
                        break;
                    }
                }
            }

            processed += 1;
            if !pr_ok {
                stopped_on_error = true;
                break;
            }
            advance_to = Some((pr.merged_at, pr.number));
        }

        if let Some((merged_at, number)) = advance_to {
            let mut txn = self.store.begin_transaction().await?;
            txn.record_repo_done_reconcile_cursor(repo, DoneReconcileCursor { last_merged_at: Some(merged_at), last_pr_number: Some(number) }).await?;
            txn.commit().await?;
        }

        info!(repo, processed, labeled, stopped_on_error, "done reconcile tick complete");
        Ok(self.done(repo, ReconcileStatus::Ok, processed, labeled, stopped_on_error))
    }

    fn done(&self, repo: &str, status: ReconcileStatus, prs_processed: usize, issues_labeled_done: usize, stopped_on_error: bool) -> ReconcileOutcome {
        let next_delay = self.record_backoff(repo, stopped_on_error || prs_processed > 0);
        ReconcileOutcome { repo: repo.to_string(), status, prs_processed, issues_labeled_done, stopped_on_error, next_delay }
    }

    fn record_backoff(&self, repo: &str, had_activity: bool) -> Duration {
        let mut backoff = self.backoff.lock().expect("reconciler backoff mutex poisoned");
        let entry = backoff.entry(repo.to_string()).or_default();
        entry.multiplier = if had_activity { 1 } else { (entry.multiplier.max(1) * 3 / 2).min(self.config.max_backoff_multiplier) };
        jittered(self.config.base_backoff * entry.multiplier, self.config.jitter_fraction)
    }

    async fn ensure_labels_once(&self, repo: &str) {
        {
            let ensured = self.ensured_labels_for.lock().expect("reconciler ensured-labels mutex poisoned");
            if ensured.contains(repo) {
                return;
            }
        }
        self.labels.ensure_ralph_workflow_labels(repo).await;
        self.ensured_labels_for.lock().expect("reconciler ensured-labels mutex poisoned").insert(repo.to_string());
    }

    async fn resolve_default_branch(&self, repo: &str) -> Result<Option<String>, ReconcilerError> {
        {
            let cache = self.default_branch_cache.lock().expect("default branch cache mutex poisoned");
            if let Some((branch, fetched_at)) = cache.get(repo) {
                if fetched_at.elapsed() < self.config.default_branch_ttl {
                    return Ok(Some(branch.clone()));
                }
            }
        }

        let resp = self
            .github
            .request(GitHubRequest::get(&format!("/repos/{repo}")).with_source("reconciler.default_branch").allow_404())
            .await?;
        let Some(branch) = resp.data.get("default_branch").and_then(|v| v.as_str()).map(String::from) else {
            return Ok(None);
        };
        self.default_branch_cache
            .lock()
            .expect("default branch cache mutex poisoned")
            .insert(repo.to_string(), (branch.clone(), Instant::now()));
        Ok(Some(branch))
    }

    async fn search_merged_prs(&self, repo: &str, default_branch: &str, since: DateTime<Utc>) -> Result<Vec<MergedPr>, ReconcilerError> {
        let query = format!("repo:{repo} is:pr is:merged base:{default_branch} merged:>={}", since.to_rfc3339());
        let mut prs = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let data = self
                .github
                .graphql(SEARCH_MERGED_PRS_QUERY, json!({ "q": query, "after": after }), Some("reconciler.search_merged_prs"))
                .await?;
            let search = data.get("search").cloned().unwrap_or(Value::Null);
            let nodes = search.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();

            for node in &nodes {
                let Some(number) = node.get("number").and_then(Value::as_u64) else { continue };
                let Some(merged_at) = node
                    .get("mergedAt")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc))
                else {
                    continue;
                };
                let closing_issues = node
                    .pointer("/closingIssuesReferences/nodes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|i| {
                        let number = i.get("number").and_then(Value::as_u64)?;
                        let repo = i.pointer("/repository/nameWithOwner").and_then(Value::as_str)?.to_string();
                        let is_open = i.get("state").and_then(Value::as_str) == Some("OPEN");
                        let labels = i
                            .pointer("/labels/nodes")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default()
                            .iter()
                            .filter_map(|l| l.get("name").and_then(Value::as_str).map(String::from))
                            .collect();
                        Some(ClosingIssue { repo, number, is_open, labels })
                    })
                    .collect();
                prs.push(MergedPr { number, merged_at, closing_issues });
            }

            let has_next = search.pointer("/pageInfo/hasNextPage").and_then(Value::as_bool).unwrap_or(false);
            if !has_next {
                break;
            }
            after = search.pointer("/pageInfo/endCursor").and_then(Value::as_str).map(String::from);
            if after.is_none() {
                break;
            }
        }

        Ok(prs)
    }
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    use rand::Rng;
    let jitter = base.mul_f64(fraction);
    let delta_ms = rand::thread_rng().gen_range(-(jitter.as_millis() as i64)..=(jitter.as_millis() as i64));
    let base_ms = base.as_millis() as i64;
    Duration::from_millis((base_ms + delta_ms).max(0) as u64)
}

const SEARCH_MERGED_PRS_QUERY: &str = r#"
query($q: String!, $after: String) {
  search(query: $q, type: ISSUE, first: 50, after: $after) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on PullRequest {
        number
        mergedAt
        closingIssuesReferences(first: 20) {
          nodes {
            number
            state
            repository { nameWithOwner }
            labels(first: 20) { nodes { name } }
          }
        }
      }
    }
  }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{GitHubClientConfig, StaticToken};
    use crate::store::memory::InMemoryStore;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn reconciler_with(server: &MockServer) -> (DoneReconciler, Arc<dyn StateStore>) {
        let github = Arc::new(GitHubClient::new(
            Arc::new(StaticToken("t".into())),
            GitHubClientConfig { rest_base_url: server.uri(), graphql_url: format!("{}/graphql", server.uri()), ..Default::default() },
        ));
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let labels = Arc::new(LabelCoordinator::new(github.clone(), store.clone()));
        (DoneReconciler::new(github, store.clone(), labels, ReconcilerConfig::default(), None), store)
    }

    #[tokio::test]
    async fn first_tick_initializes_the_cursor_without_processing() {
        let server = MockServer::start().await;
        let (reconciler, store) = reconciler_with(&server).await;
        let outcome = reconciler.tick("o/r").await.unwrap();
        assert_eq!(outcome.status, ReconcileStatus::CursorInitialized);
        let cursor = store.get_repo_issue_sync_cursor("o/r").await.unwrap().done_reconcile;
        assert!(cursor.last_merged_at.is_some());
    }

    #[tokio::test]
    async fn legacy_scheme_error_skips_the_tick() {
        let server = MockServer::start().await;
        let (reconciler, store) = reconciler_with(&server).await;
        store
            .set_repo_legacy_label_scheme_error(
                "o/r",
                Some(crate::store::LegacyLabelSchemeError { detected_at: Utc::now(), details: "x".into() }),
            )
            .await
            .unwrap();
        let outcome = reconciler.tick("o/r").await.unwrap();
        assert_eq!(outcome.status, ReconcileStatus::SkippedLegacyScheme);
    }

    #[tokio::test]
    async fn repo_outside_the_allowlist_is_skipped() {
        let server = MockServer::start().await;
        let github = Arc::new(GitHubClient::new(
            Arc::new(StaticToken("t".into())),
            GitHubClientConfig { rest_base_url: server.uri(), ..Default::default() },
        ));
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let labels = Arc::new(LabelCoordinator::new(github.clone(), store.clone()));
        let allowed = HashSet::from(["o/other".to_string()]);
        let reconciler = DoneReconciler::new(github, store, labels, ReconcilerConfig::default(), Some(allowed));
        let outcome = reconciler.tick("o/r").await.unwrap();
        assert_eq!(outcome.status, ReconcileStatus::SkippedNotAllowed);
    }

    #[tokio::test]
    async fn merged_pr_with_open_ralph_issue_gets_labeled_done() {
        let server = MockServer::start().await;
        let (reconciler, store) = reconciler_with(&server).await;

        // Seed a cursor so the tick proceeds past initialization.
        {
            let mut txn = store.begin_transaction().await.unwrap();
            txn.record_repo_done_reconcile_cursor(
                "o/r",
                DoneReconcileCursor { last_merged_at: Some(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)), last_pr_number: Some(0) },
            )
            .await
            .unwrap();
            txn.commit().await.unwrap();
        }

        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "default_branch": "main" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "search": {
                        "pageInfo": { "hasNextPage": false, "endCursor": null },
                        "nodes": [{
                            "number": 42,
                            "mergedAt": "2026-01-02T00:00:00Z",
                            "closingIssuesReferences": {
                                "nodes": [{
                                    "number": 7,
                                    "state": "OPEN",
                                    "repository": { "nameWithOwner": "o/r" },
                                    "labels": { "nodes": [{ "name": "ralph:status:in-progress" }] }
                                }]
                            }
                        }]
                    }
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/labels"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/issues/7/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues/7/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![json!({ "name": "ralph:done" })]))
            .mount(&server)
            .await;

        let outcome = reconciler.tick("o/r").await.unwrap();
        assert_eq!(outcome.status, ReconcileStatus::Ok);
        assert_eq!(outcome.prs_processed, 1);
        assert_eq!(outcome.issues_labeled_done, 1);
        let cursor = store.get_repo_issue_sync_cursor("o/r").await.unwrap().done_reconcile;
        assert_eq!(cursor.last_pr_number, Some(42));
    }
}
