//! Parent-verification writeback.
//!
//! On success this posts/updates a verification comment, then the caller
//! closes the issue and removes any open-queue status labels via C5 — the
//! close step is a plain issue PATCH, not itself marker-keyed, so it lives
//! next to the plan here rather than inside the generic engine.

use serde_json::json;

use crate::github::{GitHubApiError, GitHubClient, GitHubRequest};

use super::engine::WritebackPlan;
use super::marker::derive_marker_id;

/// Open question resolved here: the relationship-resolution coverage is an
/// explicit three-way enum rather than a boolean, so "partial" coverage
/// can't be confused with either extreme (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageStatus {
    Complete,
    Partial,
    Unavailable,
}

pub fn plan_parent_verify(repo: &str, issue_number: u64, coverage: CoverageStatus, summary: &str) -> WritebackPlan {
    let base = format!("parent-verify|{repo}|{issue_number}");
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-parent-verify:id={marker_id} -->");

    let coverage_line = match coverage {
        CoverageStatus::Complete => "All linked sub-tasks verified complete.",
        CoverageStatus::Partial => "Some linked sub-tasks could not be verified; proceeding on majority coverage.",
        CoverageStatus::Unavailable => "Sub-task coverage could not be determined; verifying on parent signal alone.",
    };

    let body = format!("{marker}\n**Parent verification:** {coverage_line}\n\n{summary}\n");

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels: Vec::new(),
        remove_labels: vec![
            "ralph:status:queued".to_string(),
            "ralph:status:blocked".to_string(),
            "ralph:status:in-progress".to_string(),
        ],
        idempotency_key: format!("parent-verify:{repo}#{issue_number}:{marker_id}"),
        scope: "parent-verify".to_string(),
    }
}

/// Close the issue after a successful verification writeback.
pub async fn close_verified_issue(github: &GitHubClient, repo: &str, issue_number: u64) -> Result<(), GitHubApiError> {
    github
        .request(GitHubRequest {
            method: reqwest::Method::PATCH,
            path: &format!("/repos/{repo}/issues/{issue_number}"),
            body: Some(json!({ "state": "closed" })),
            allow_not_found: false,
            source: Some("parent_verify.close"),
        })
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_coverage_uses_explicit_enum_language_not_a_boolean() {
        let plan = plan_parent_verify("o/r", 9, CoverageStatus::Partial, "3 of 4 sub-tasks verified.");
        assert!(plan.comment_body.contains("majority coverage"));
    }

    #[test]
    fn removes_all_open_queue_status_labels() {
        let plan = plan_parent_verify("o/r", 9, CoverageStatus::Complete, "done");
        assert_eq!(
            plan.remove_labels,
            vec![
                "ralph:status:queued".to_string(),
                "ralph:status:blocked".to_string(),
                "ralph:status:in-progress".to_string(),
            ]
        );
        assert!(plan.add_labels.is_empty());
    }
}
