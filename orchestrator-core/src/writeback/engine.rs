//! Generic plan/apply engine shared by every writeback kind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::github::{GitHubApiError, GitHubClient, GitHubRequest};
use crate::labels::{ExecuteLabelOpsRequest, LabelCoordinator, LabelOp, WriteClass};
use crate::store::StateStore;

/// What the caller (an escalation/watchdog/… writeback) wants done.
#[derive(Debug, Clone)]
pub struct WritebackPlan {
    pub marker: String,
    pub marker_id: String,
    pub comment_body: String,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub idempotency_key: String,
    /// `scope` passed to the idempotency-key store, e.g. `"escalation"`, `"watchdog.stuck"`.
    pub scope: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentAction {
    Noop,
    Patch,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WritebackOutcome {
    pub posted_comment: bool,
    pub skipped_comment: bool,
    pub marker_found: bool,
}

#[derive(Debug, Error)]
pub enum WritebackError {
    #[error(transparent)]
    GitHub(#[from] GitHubApiError),
    #[error("store error: {0}")]
    Store(String),
}

/// One comment as read back from GraphQL, enough to run the create/patch/noop
/// decision table below.
#[derive(Debug, Clone)]
pub struct CommentRecord {
    pub database_id: Option<i64>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub struct WritebackContext<'a> {
    pub github: &'a GitHubClient,
    pub store: &'a dyn StateStore,
    pub labels: &'a Arc<LabelCoordinator>,
    pub repo: &'a str,
    pub issue_number: u64,
    /// Max comments to scan for an existing marker.
    pub scan_cap: usize,
}

fn normalize_body(body: &str) -> String {
    body.trim_end_matches('\n').to_string()
}

fn body_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_body(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Run one writeback: apply labels (non-blocking), then reconcile the
/// marker-keyed comment against the idempotency key plus a comment scan.
pub async fn apply_writeback(ctx: &WritebackContext<'_>, plan: WritebackPlan) -> Result<WritebackOutcome, WritebackError> {
    apply_label_ops(ctx, &plan).await;

    let has_key = ctx.store.has_key(&plan.idempotency_key).await.map_err(|e| WritebackError::Store(e.to_string()))?;
    let scan = fetch_marker_comments(ctx, &plan.marker_id).await?;
    let desired_hash = body_hash(&plan.comment_body);

    let newest = scan
        .matches
        .iter()
        .max_by_key(|c| c.created_at);

    let (action, marker_found) = match newest {
        Some(existing) => {
            let found = true;
            if normalize_body(&existing.body) == normalize_body(&plan.comment_body) {
                (CommentAction::Noop, found)
            } else if existing.database_id.is_some() {
                (CommentAction::Patch, found)
            } else {
                (CommentAction::Post, found)
            }
        }
        None => {
            if has_key && !scan.complete {
                let prior_hash = ctx
                    .store
                    .get_payload(&plan.idempotency_key)
                    .await
                    .map_err(|e| WritebackError::Store(e.to_string()))?
                    .and_then(|v| v.get("bodyHash").and_then(Value::as_str).map(str::to_string));
                if prior_hash.as_deref() == Some(desired_hash.as_str()) {
                    (CommentAction::Noop, false)
                } else {
                    (CommentAction::Post, false)
                }
            } else if has_key && scan.complete {
                // Key claims it exists but the scan proves it doesn't: stale
                // key, treat as new.
                let _ = ctx.store.delete_key(&plan.idempotency_key).await;
                (CommentAction::Post, false)
            } else {
                (CommentAction::Post, false)
            }
        }
    };

    match action {
        CommentAction::Noop => {
            let _ = ctx
                .store
                .upsert_key(&plan.idempotency_key, &plan.scope, Some(json!({ "bodyHash": desired_hash })))
                .await;
            Ok(WritebackOutcome { posted_comment: false, skipped_comment: true, marker_found })
        }
        CommentAction::Patch => {
            let database_id = newest.and_then(|c| c.database_id).expect("patch action implies a database_id");
            ctx.store.record_key_if_absent(&plan.idempotency_key, &plan.scope, None).await.ok();
            let result = patch_comment(ctx, database_id, &plan.comment_body).await;
            finish_write(ctx, &plan, desired_hash, result).await.map(|()| WritebackOutcome {
                posted_comment: true,
                skipped_comment: false,
                marker_found,
            })
        }
        CommentAction::Post => {
            ctx.store.record_key_if_absent(&plan.idempotency_key, &plan.scope, None).await.ok();
            let result = post_comment(ctx, &plan.comment_body).await;
            finish_write(ctx, &plan, desired_hash, result).await.map(|()| WritebackOutcome {
                posted_comment: true,
                skipped_comment: false,
                marker_found,
            })
        }
    }
}

async fn finish_write(
    ctx: &WritebackContext<'_>,
    plan: &WritebackPlan,
    body_hash: String,
    result: Result<(), GitHubApiError>,
) -> Result<(), WritebackError> {
    match result {
        Ok(()) => {
            let _ = ctx
                .store
                .upsert_key(&plan.idempotency_key, &plan.scope, Some(json!({ "bodyHash": body_hash })))
                .await;
            Ok(())
        }
        Err(err) => {
            // Delete-on-failure so a retry can re-attempt.
            let _ = ctx.store.delete_key(&plan.idempotency_key).await;
            Err(err.into())
        }
    }
}

async fn apply_label_ops(ctx: &WritebackContext<'_>, plan: &WritebackPlan) {
    if plan.add_labels.is_empty() && plan.remove_labels.is_empty() {
        return;
    }
    let mut ops: Vec<LabelOp> = plan.add_labels.iter().map(LabelOp::add).collect();
    ops.extend(plan.remove_labels.iter().map(LabelOp::remove));
    let req = ExecuteLabelOpsRequest {
        repo: ctx.repo.to_string(),
        issue_number: ctx.issue_number,
        ops,
        write_class: WriteClass::Critical,
        allow_non_ralph: false,
        desired_status_hint: plan.add_labels.iter().find(|l| l.starts_with("ralph:status:")).cloned(),
        has_active_op_state: false,
        coalesce_window: std::time::Duration::from_millis(0),
    };
    if let Err(err) = ctx.labels.clone().execute(req).await {
        warn!(repo = ctx.repo, issue = ctx.issue_number, error = %err, "writeback label op failed (non-blocking)");
    }
}

struct CommentScan {
    matches: Vec<CommentRecord>,
    complete: bool,
}

const COMMENTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $last: Int!) {
  repository(owner: $owner, name: $name) {
    issue(number: $number) {
      comments(last: $last) {
        totalCount
        nodes { databaseId body createdAt }
      }
    }
  }
}
"#;

async fn fetch_marker_comments(ctx: &WritebackContext<'_>, marker_id: &str) -> Result<CommentScan, WritebackError> {
    let (owner, name) = ctx.repo.split_once('/').unwrap_or((ctx.repo, ""));
    let data = ctx
        .github
        .graphql(
            COMMENTS_QUERY,
            json!({ "owner": owner, "name": name, "number": ctx.issue_number, "last": ctx.scan_cap }),
            Some("writeback.scan_comments"),
        )
        .await?;

    let comments = data
        .pointer("/repository/issue/comments")
        .cloned()
        .unwrap_or(Value::Null);
    let total_count = comments.get("totalCount").and_then(Value::as_u64).unwrap_or(0);
    let nodes = comments.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();

    let marker_needle_upper = marker_id.to_uppercase();
    let matches = nodes
        .iter()
        .filter_map(|n| {
            let body = n.get("body").and_then(Value::as_str)?.to_string();
            if !body.to_uppercase().contains(&marker_needle_upper) {
                return None;
            }
            let created_at = n
                .get("createdAt")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))?;
            Some(CommentRecord { database_id: n.get("databaseId").and_then(Value::as_i64), body, created_at })
        })
        .collect();

    Ok(CommentScan { matches, complete: (nodes.len() as u64) >= total_count })
}

async fn post_comment(ctx: &WritebackContext<'_>, body: &str) -> Result<(), GitHubApiError> {
    ctx.github
        .request(GitHubRequest {
            method: reqwest::Method::POST,
            path: &format!("/repos/{}/issues/{}/comments", ctx.repo, ctx.issue_number),
            body: Some(json!({ "body": body })),
            allow_not_found: false,
            source: Some("writeback.post"),
        })
        .await
        .map(|_| ())
}

async fn patch_comment(ctx: &WritebackContext<'_>, database_id: i64, body: &str) -> Result<(), GitHubApiError> {
    ctx.github
        .request(GitHubRequest {
            method: reqwest::Method::PATCH,
            path: &format!("/repos/{}/issues/comments/{}", ctx.repo, database_id),
            body: Some(json!({ "body": body })),
            allow_not_found: false,
            source: Some("writeback.patch"),
        })
        .await
        .map(|_| ())
}

/// Truncate `s` to at most `max_chars` characters, appending an ellipsis
/// marker when truncated.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Cap a full comment body to `max_bytes`, truncating at a char boundary.
pub fn cap_body_bytes(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n…[truncated]", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_body_strips_trailing_newlines_only() {
        assert_eq!(normalize_body("hello\n\n"), "hello");
        assert_eq!(normalize_body("hello\nworld"), "hello\nworld");
    }

    #[test]
    fn truncate_with_ellipsis_respects_cap() {
        let s = "a".repeat(10);
        assert_eq!(truncate_with_ellipsis(&s, 20), s);
        let truncated = truncate_with_ellipsis(&s, 5);
        assert_eq!(truncated.chars().count(), 5);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn cap_body_bytes_truncates_at_char_boundary() {
        let body = "héllo world".repeat(100);
        let capped = cap_body_bytes(&body, 20);
        assert!(capped.len() <= 20 + "\n…[truncated]".len());
        assert!(std::str::from_utf8(capped.as_bytes()).is_ok());
    }

    #[test]
    fn body_hash_is_stable_modulo_trailing_newline() {
        assert_eq!(body_hash("same text"), body_hash("same text\n"));
        assert_ne!(body_hash("text a"), body_hash("text b"));
    }
}
