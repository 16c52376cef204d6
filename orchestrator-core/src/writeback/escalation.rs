//! Escalation writeback.

use crate::redact::redact_default;

use super::engine::{truncate_with_ellipsis, WritebackPlan};
use super::marker::derive_marker_id;

const REASON_CAP: usize = 500;

/// Build the escalation plan for `repo#issue_number`. `retry_index`
/// disambiguates successive escalations of the same issue in the marker id.
pub fn plan_escalation(repo: &str, issue_number: u64, owner: &str, reason: &str, retry_index: u32) -> WritebackPlan {
    let base = format!("escalation|{repo}|{issue_number}|{retry_index}");
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-escalation:id={marker_id} -->");
    let reason = truncate_with_ellipsis(&redact_default(reason), REASON_CAP);

    let body = format!(
        "{marker}\n\
         @{owner} this task has been escalated and needs human input.\n\n\
         **Reason:** {reason}\n\n\
         **To resolve:**\n\
         - Comment with `ralph: resume` once guidance has been given, or\n\
         - Re-add the `ralph:status:queued` label to send it back to the queue.\n"
    );

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels: vec!["ralph:status:escalated".to_string()],
        remove_labels: vec![
            "ralph:status:in-progress".to_string(),
            "ralph:status:queued".to_string(),
            "ralph:status:stuck".to_string(),
        ],
        idempotency_key: format!("escalation:{repo}#{issue_number}:{marker_id}"),
        scope: "escalation".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_includes_marker_and_owner_mention() {
        let plan = plan_escalation("o/r", 42, "maintainer", "need guidance", 0);
        assert!(plan.comment_body.starts_with(&plan.marker));
        assert!(plan.comment_body.contains("@maintainer"));
        assert!(plan.comment_body.contains("ralph: resume"));
        assert_eq!(plan.add_labels, vec!["ralph:status:escalated"]);
    }

    #[test]
    fn plan_redacts_and_caps_reason() {
        let long_reason = format!("token ghp_{} overflow", "a".repeat(600));
        let plan = plan_escalation("o/r", 42, "m", &long_reason, 0);
        assert!(!plan.comment_body.contains("ghp_aaaa"));
        assert!(plan.comment_body.contains("ghp_[REDACTED]"));
    }

    #[test]
    fn different_retry_index_yields_different_marker_id() {
        let a = plan_escalation("o/r", 1, "m", "r", 0);
        let b = plan_escalation("o/r", 1, "m", "r", 1);
        assert_ne!(a.marker_id, b.marker_id);
    }
}
