//! Merge-conflict and cmd-decision writebacks.
//!
//! Both kinds persist structured JSON on a *second* marker line below the
//! identity marker line; readers parse that state line to decide whether to
//! re-enter (retry a merge-conflict fix, or skip a `ralph:cmd:*` decision
//! already processed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::WritebackPlan;
use super::marker::derive_marker_id;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeConflictAttempt {
    pub at: DateTime<Utc>,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeConflictState {
    pub version: u32,
    pub lease: Option<Lease>,
    pub attempts: Vec<MergeConflictAttempt>,
}

impl MergeConflictState {
    pub fn new() -> Self {
        Self { version: 1, lease: None, attempts: Vec::new() }
    }

    /// Whether the lease is currently held by someone other than `holder`
    /// and has not expired — the signal a retry loop uses to back off
    /// instead of double-attempting the same conflict.
    pub fn is_leased_by_other(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match &self.lease {
            Some(lease) => lease.holder != holder && lease.expires_at > now,
            None => false,
        }
    }
}

impl Default for MergeConflictState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn plan_merge_conflict(repo: &str, issue_number: u64, pr_number: u64, state: &MergeConflictState) -> WritebackPlan {
    let base = format!("merge-conflict|{repo}|{issue_number}|{pr_number}");
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-merge-conflict:id={marker_id} -->");
    let state_json = serde_json::to_string(state).expect("MergeConflictState serializes infallibly");
    let body = format!(
        "{marker}\n<!-- ralph-merge-conflict:state={state_json} -->\n\
         PR #{pr_number} has a merge conflict; attempt {} in progress.\n",
        state.attempts.len() + 1
    );

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels: Vec::new(),
        remove_labels: Vec::new(),
        idempotency_key: format!("merge-conflict:{repo}#{issue_number}:{pr_number}:{marker_id}"),
        scope: "merge-conflict".to_string(),
    }
}

/// Parse the `ralph-merge-conflict:state={...}` line out of a comment body.
pub fn parse_merge_conflict_state(body: &str) -> Option<MergeConflictState> {
    parse_state_line(body, "ralph-merge-conflict:state=")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdState {
    pub key: String,
    pub decision: String,
    pub processed_at: DateTime<Utc>,
}

pub fn plan_cmd(repo: &str, issue_number: u64, state: &CmdState) -> WritebackPlan {
    let base = format!("cmd|{repo}|{issue_number}|{}", state.key);
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-cmd:id={marker_id} -->");
    let state_json = serde_json::to_string(state).expect("CmdState serializes infallibly");
    let body = format!("{marker}\n<!-- ralph-cmd:state={state_json} -->\nProcessed `{}`: {}\n", state.key, state.decision);

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels: Vec::new(),
        remove_labels: Vec::new(),
        idempotency_key: format!("cmd:{repo}#{issue_number}:{}:{marker_id}", state.key),
        scope: "cmd".to_string(),
    }
}

pub fn parse_cmd_state(body: &str) -> Option<CmdState> {
    parse_state_line(body, "ralph-cmd:state=")
}

fn parse_state_line<T: for<'de> Deserialize<'de>>(body: &str, prefix: &str) -> Option<T> {
    for line in body.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("<!--").map(str::trim) else { continue };
        let Some(rest) = rest.strip_prefix(prefix) else { continue };
        let json_part = rest.rsplit_once("-->").map(|(json, _)| json).unwrap_or(rest);
        if let Ok(value) = serde_json::from_str(json_part.trim()) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_state_round_trips_through_the_comment_body() {
        let mut state = MergeConflictState::new();
        state.attempts.push(MergeConflictAttempt { at: Utc::now(), outcome: "conflict".into() });
        let plan = plan_merge_conflict("o/r", 1, 42, &state);
        let parsed = parse_merge_conflict_state(&plan.comment_body).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn lease_held_by_other_and_unexpired_blocks_reentry() {
        let now = Utc::now();
        let state = MergeConflictState {
            version: 1,
            lease: Some(Lease { holder: "worker-a".into(), expires_at: now + chrono::Duration::minutes(5) }),
            attempts: Vec::new(),
        };
        assert!(state.is_leased_by_other("worker-b", now));
        assert!(!state.is_leased_by_other("worker-a", now));
    }

    #[test]
    fn expired_lease_does_not_block_reentry() {
        let now = Utc::now();
        let state = MergeConflictState {
            version: 1,
            lease: Some(Lease { holder: "worker-a".into(), expires_at: now - chrono::Duration::minutes(1) }),
            attempts: Vec::new(),
        };
        assert!(!state.is_leased_by_other("worker-b", now));
    }

    #[test]
    fn cmd_state_round_trips_through_the_comment_body() {
        let state = CmdState { key: "priority:p1".into(), decision: "applied".into(), processed_at: Utc::now() };
        let plan = plan_cmd("o/r", 7, &state);
        let parsed = parse_cmd_state(&plan.comment_body).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn parse_returns_none_when_no_state_line_present() {
        assert!(parse_merge_conflict_state("just a plain comment").is_none());
    }
}
