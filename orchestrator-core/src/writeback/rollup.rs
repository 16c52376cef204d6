//! Rollup-ready writeback.

use super::engine::{cap_body_bytes, WritebackPlan};
use super::marker::derive_marker_id;

const ROLLUP_BODY_CAP_BYTES: usize = 8_000;

pub fn plan_rollup_ready(repo: &str, issue_number: u64, summary: &str) -> WritebackPlan {
    let base = format!("rollup-ready|{repo}|{issue_number}");
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-rollup-ready:id={marker_id} -->");
    let body = cap_body_bytes(
        &format!("{marker}\nThis task's sub-work is complete and ready to roll up.\n\n{summary}\n"),
        ROLLUP_BODY_CAP_BYTES,
    );

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels: Vec::new(),
        remove_labels: Vec::new(),
        idempotency_key: format!("rollup-ready:{repo}#{issue_number}:{marker_id}"),
        scope: "rollup-ready".to_string(),
    }
}
