//! Issue Mirror / Poller: per-repo GitHub issue ingestion
//! into [`crate::store`], bootstrap-then-incremental, semaphore-gated.
//!
//! `sipag-core`'s closest analogue is `worker::github::list_approved_issues`
//! (`worker/github.rs`) — a single-page, single-label `gh issue list` call,
//! because `sipag` only ever needs "issues with the work label right now".
//! Mirroring the full issue set across many repos with resumable pagination
//! and a persisted cursor is new territory; the per-repo-independent
//! semaphore gate mirrors the same bounded-concurrency shape
//! `LabelCoordinator`'s per-issue lock map and `EventBus`'s subscriber map
//! already use in this crate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::github::{
    parse_link_header, validate_issues_cursor_url, ErrorKind, GitHubApiError, GitHubClient, GitHubRequest,
    GitHubResponse,
};
use crate::store::{BootstrapCursor, IssueSnapshot, IssueState, LegacyLabelSchemeError, StateStore, StoreError};

/// Pre-vNext, non-namespaced workflow labels. The
/// `sipag-core`'s own default `work_label` ("ready", `WorkerConfig::work_label`
/// in `sipag-core::config`) is exactly this kind of flat label a `ralph:*`
/// rollout must detect and refuse to operate alongside.
pub const LEGACY_WORKFLOW_LABELS: [&str; 5] = ["ready", "in-progress", "blocked", "wip", "needs-review"];

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub per_page: u32,
    pub max_pages_per_tick: u32,
    pub max_issues_per_tick: u32,
    pub incremental_skew: Duration,
    pub base_backoff: Duration,
    pub max_backoff_multiplier: u32,
    pub jitter_fraction: f64,
    /// "all-open" selection policy — store every OPEN issue regardless of `ralph:*` labels.
    pub all_open_policy: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            per_page: 100,
            max_pages_per_tick: 2,
            max_issues_per_tick: 200,
            incremental_skew: Duration::from_secs(5),
            base_backoff: Duration::from_secs(5),
            max_backoff_multiplier: 10,
            jitter_fraction: 0.2,
            all_open_policy: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    GitHub(#[from] GitHubApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tick aborted")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickStatus {
    Ok,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub repo: String,
    pub status: TickStatus,
    pub fetched: usize,
    pub stored: usize,
    pub legacy_scheme_detected: bool,
    /// How long the scheduler should wait before the next tick for this
    /// repo. The scheduler is
    /// what actually sleeps; this module only computes the delay.
    pub next_delay: Duration,
}

#[derive(Default, Clone, Copy)]
struct RepoBackoff {
    multiplier: u32,
}

/// One logical poller shared by every configured repo, gated by a
/// process-wide semaphore.
pub struct IssueMirror {
    github: Arc<GitHubClient>,
    store: Arc<dyn StateStore>,
    config: MirrorConfig,
    semaphore: Arc<Semaphore>,
    backoff: StdMutex<std::collections::HashMap<String, RepoBackoff>>,
}

impl IssueMirror {
    pub fn new(github: Arc<GitHubClient>, store: Arc<dyn StateStore>, config: MirrorConfig, max_in_flight: usize) -> Self {
        Self {
            github,
            store,
            config,
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            backoff: StdMutex::new(std::collections::HashMap::new()),
        }
    }

    /// Run one poll tick for `repo`. Acquires a permit from the shared semaphore for the duration
    /// of the tick so different repos proceed independently up to the
    /// configured concurrency limit.
    pub async fn tick(&self, repo: &str, cancel: &CancellationToken) -> Result<TickOutcome, MirrorError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        let cursor = self.store.get_repo_issue_sync_cursor(repo).await?;
        let bootstrapping = cursor.last_sync_at.is_none();

        let mut fetched = 0usize;
        let mut stored = 0usize;
        let mut pages = 0u32;
        let mut legacy_scheme_detected = false;
        let mut max_updated_at: Option<DateTime<Utc>> = None;
        let mut high_watermark = cursor.bootstrap.as_ref().and_then(|b| b.high_watermark);

        let mut next_url = if bootstrapping {
            match &cursor.bootstrap {
                Some(b) if b.next_url.as_deref().is_some_and(validate_issues_cursor_url) => b.next_url.clone(),
                _ => Some(self.first_page_url(repo, None)),
            }
        } else {
            let since = cursor.last_sync_at.unwrap() - chrono::Duration::from_std(self.config.incremental_skew).unwrap();
            Some(self.first_page_url(repo, Some(since)))
        };

        let mut link_next: Option<String> = None;

        while let Some(url) = next_url.take() {
            if cancel.is_cancelled() {
                return Ok(TickOutcome {
                    repo: repo.to_string(),
                    status: TickStatus::Aborted,
                    fetched,
                    stored,
                    legacy_scheme_detected,
                    next_delay: self.config.base_backoff,
                });
            }
            if pages >= self.config.max_pages_per_tick || fetched as u32 >= self.config.max_issues_per_tick {
                link_next = Some(url);
                break;
            }

            let page = match self.fetch_page(&url).await {
                Ok(page) => page,
                Err(err) => {
                    self.record_error_and_backoff(repo, &err);
                    return Err(err.into());
                }
            };
            pages += 1;

            let rows = page.data.as_array().cloned().unwrap_or_default();
            let mut page_max_updated: Option<DateTime<Utc>> = None;
            let mut to_store: Vec<IssueSnapshot> = Vec::new();

            for row in &rows {
                if row.get("pull_request").is_some() {
                    continue;
                }
                let Some(snapshot) = parse_issue_row(repo, row) else { continue };
                fetched += 1;
                page_max_updated = Some(page_max_updated.map_or(snapshot.github_updated_at, |m| m.max(snapshot.github_updated_at)));

                if snapshot.state == IssueState::Open && has_legacy_label(&snapshot.labels) {
                    legacy_scheme_detected = true;
                }

                let already_tracked = self.store.has_issue_snapshot(repo, snapshot.number).await?;
                let has_ralph_label = snapshot.labels.iter().any(|l| l.starts_with("ralph:"));
                let select = has_ralph_label
                    || already_tracked
                    || (self.config.all_open_policy && snapshot.state == IssueState::Open);
                if select {
                    to_store.push(snapshot);
                }
                if fetched as u32 >= self.config.max_issues_per_tick {
                    break;
                }
            }

            if let Some(m) = page_max_updated {
                max_updated_at = Some(max_updated_at.map_or(m, |prev| prev.max(m)));
                high_watermark = Some(high_watermark.map_or(m, |prev| prev.max(m)));
            }

            if !to_store.is_empty() {
                stored += to_store.len();
                let mut txn = self.store.begin_transaction().await?;
                for snapshot in to_store {
                    let labels = snapshot.labels.clone();
                    let number = snapshot.number;
                    txn.record_issue_snapshot(snapshot).await?;
                    txn.record_issue_labels_snapshot(repo, number, labels).await?;
                }
                txn.commit().await?;
            }

            link_next = page.link.as_deref().and_then(|h| {
                parse_link_header(h).into_iter().find(|(rel, _)| rel == "next").map(|(_, u)| u)
            });

            if bootstrapping {
                // Incremental early-stop: a returned page's last row older
                // than `since` means we've caught up.
            } else if let Some(last_row) = rows.last() {
                if let Some(ts) = last_row.get("updated_at").and_then(|v| v.as_str()).and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
                    let since = cursor.last_sync_at.unwrap() - chrono::Duration::from_std(self.config.incremental_skew).unwrap();
                    if ts.with_timezone(&Utc) < since {
                        link_next = None;
                    }
                }
            }

            next_url = link_next.clone();
        }

        self.advance_cursor(repo, bootstrapping, link_next, high_watermark, max_updated_at, fetched, &cursor.last_sync_at).await?;

        if legacy_scheme_detected {
            self.store
                .set_repo_legacy_label_scheme_error(
                    repo,
                    Some(LegacyLabelSchemeError {
                        detected_at: Utc::now(),
                        details: "open issue(s) carry pre-vNext workflow labels".to_string(),
                    }),
                )
                .await?;
            warn!(repo, "legacy workflow label scheme detected; downstream reconcilers disabled for this repo");
        }

        let next_delay = self.record_success_and_backoff(repo, fetched > 0);
        info!(repo, fetched, stored, pages, "issue mirror tick complete");
        Ok(TickOutcome { repo: repo.to_string(), status: TickStatus::Ok, fetched, stored, legacy_scheme_detected, next_delay })
    }

    fn first_page_url(&self, repo: &str, since: Option<DateTime<Utc>>) -> String {
        let mut url = format!(
            "https://api.github.com/repos/{repo}/issues?state=all&sort=updated&direction=desc&per_page={}",
            self.config.per_page
        );
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since.to_rfc3339()));
        }
        url
    }

    async fn fetch_page(&self, url: &str) -> Result<GitHubResponse, GitHubApiError> {
        let path = url.strip_prefix("https://api.github.com").unwrap_or(url);
        self.github.request(GitHubRequest::get(path).with_source("mirror.tick")).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn advance_cursor(
        &self,
        repo: &str,
        bootstrapping: bool,
        link_next: Option<String>,
        high_watermark: Option<DateTime<Utc>>,
        max_updated_at: Option<DateTime<Utc>>,
        fetched: usize,
        prior_last_sync_at: &Option<DateTime<Utc>>,
    ) -> Result<(), MirrorError> {
        let mut txn = self.store.begin_transaction().await?;
        if bootstrapping {
            match link_next {
                Some(next_url) => {
                    txn.record_repo_issue_bootstrap_cursor(repo, BootstrapCursor { next_url: Some(next_url), high_watermark }).await?;
                }
                None => {
                    txn.record_repo_issue_sync(repo, high_watermark.unwrap_or_else(Utc::now)).await?;
                    txn.clear_repo_issue_bootstrap_cursor(repo).await?;
                }
            }
        } else {
            let new_last_sync_at = if fetched == 0 {
                prior_last_sync_at.unwrap_or_else(Utc::now)
            } else {
                max_updated_at.unwrap_or_else(Utc::now)
            };
            txn.record_repo_issue_sync(repo, new_last_sync_at).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    fn record_success_and_backoff(&self, repo: &str, had_changes: bool) -> Duration {
        let mut backoff = self.backoff.lock().expect("mirror backoff mutex poisoned");
        let entry = backoff.entry(repo.to_string()).or_default();
        entry.multiplier = if had_changes { 1 } else { (entry.multiplier.max(1) * 3 / 2).min(self.config.max_backoff_multiplier) };
        jittered(self.config.base_backoff * entry.multiplier, self.config.jitter_fraction)
    }

    fn record_error_and_backoff(&self, repo: &str, err: &GitHubApiError) -> Duration {
        let mut backoff = self.backoff.lock().expect("mirror backoff mutex poisoned");
        let entry = backoff.entry(repo.to_string()).or_default();
        entry.multiplier = (entry.multiplier.max(1) * 2).min(self.config.max_backoff_multiplier);
        let mut delay = jittered(self.config.base_backoff * entry.multiplier, self.config.jitter_fraction);
        if err.code == ErrorKind::Transient {
            if let Some(reset_at) = err.rate_limit_reset {
                let until_reset = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                delay = delay.max(until_reset);
            }
        }
        delay
    }
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    let jitter = base.mul_f64(fraction);
    let delta_ms = rand::thread_rng().gen_range(-(jitter.as_millis() as i64)..=(jitter.as_millis() as i64));
    let base_ms = base.as_millis() as i64;
    Duration::from_millis((base_ms + delta_ms).max(0) as u64)
}

fn has_legacy_label(labels: &HashSet<String>) -> bool {
    LEGACY_WORKFLOW_LABELS.iter().any(|l| labels.contains(*l))
}

fn parse_issue_row(repo: &str, row: &Value) -> Option<IssueSnapshot> {
    let number = row.get("number")?.as_u64()?;
    let title = row.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let state = match row.get("state").and_then(|v| v.as_str()) {
        Some("open") => IssueState::Open,
        Some("closed") => IssueState::Closed,
        _ => return None,
    };
    let labels = row
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let github_node_id = row.get("node_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let github_updated_at = row
        .get("updated_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))?;

    Some(IssueSnapshot { repo: repo.to_string(), number, title, state, labels, github_node_id, github_updated_at })
}
