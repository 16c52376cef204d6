//! Queue State Engine: pure functions over `{issue
//! labels, op-state, now}` that derive a [`TaskView`], plan claim label
//! deltas, and detect stale in-progress leases.
//!
//! `sipag-core`'s closest analogue is `worker::decision::decide_issue_action`
//! — a pure function over `(WorkerStatus, has_existing_pr)` returning an
//! `IssueAction` enum, no I/O, exhaustively table-tested. This module keeps
//! that shape: every function here takes owned/borrowed plain data and
//! returns plain data, so the scheduler can call it without granting this crate any I/O capability.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::store::OpState;

pub const STATUS_PREFIX: &str = "ralph:status:";
pub const PRIORITY_PREFIXES: [&str; 5] = [
    "p0-critical",
    "p1-high",
    "p2-medium",
    "p3-low",
    "p4-backlog",
];

/// Ralph-owned issue status, derived from labels + op-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RalphStatus {
    Queued,
    InProgress,
    Blocked,
    Escalated,
    Done,
    Stuck,
    Paused,
}

impl RalphStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "ralph:status:queued",
            Self::InProgress => "ralph:status:in-progress",
            Self::Blocked => "ralph:status:blocked",
            Self::Escalated => "ralph:status:escalated",
            Self::Done => "ralph:status:done",
            // vNext taxonomy aliases stuck to in-progress: the label written to GitHub
            // for a watchdog-stuck worker is `ralph:status:in-progress`, but
            // the *derived* in-memory status stays distinguishable as `Stuck`
            // so callers (e.g. the control plane) can still surface it.
            Self::Stuck => "ralph:status:in-progress",
            Self::Paused => "ralph:status:paused",
        }
    }
}

/// Task priority, highest to lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    P0Critical,
    P1High,
    P2Medium,
    P3Low,
    P4Backlog,
}

impl Priority {
    pub const DEFAULT: Priority = Priority::P2Medium;

    fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        // Accepts `p1-high`, `p1`, `p1:foo`, `P1 High` etc: match on the
        // leading `p<digit>` token before any separator.
        let trimmed = lower.trim_start_matches(|c: char| c == ' ');
        let mut chars = trimmed.chars();
        if chars.next() != Some('p') {
            return None;
        }
        let digit = chars.next()?;
        match digit {
            '0' => Some(Self::P0Critical),
            '1' => Some(Self::P1High),
            '2' => Some(Self::P2Medium),
            '3' => Some(Self::P3Low),
            '4' => Some(Self::P4Backlog),
            _ => None,
        }
    }

    /// Infer priority from the highest-priority matching label
    /// (case-insensitive), defaulting to [`Priority::DEFAULT`].
    pub fn derive(labels: &HashSet<String>) -> Self {
        labels
            .iter()
            .filter_map(|l| Self::from_label(l))
            .min()
            .unwrap_or(Self::DEFAULT)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0Critical => "p0-critical",
            Self::P1High => "p1-high",
            Self::P2Medium => "p2-medium",
            Self::P3Low => "p3-low",
            Self::P4Backlog => "p4-backlog",
        }
    }
}

/// Derive the Ralph status from labels and whether an op-state is active,
/// mirroring the `deriveRalphStatus` helper this taxonomy is compatible
/// with.
///
/// `done` wins outright; `escalated` wins over queued/blocked/in-progress;
/// `blocked` requires no `queued` present; a released op-state downgrades
/// `in-progress` back to `queued`.
pub fn derive_ralph_status(labels: &HashSet<String>, op_state: Option<&OpState>) -> Option<RalphStatus> {
    if labels.contains("ralph:done") {
        return Some(RalphStatus::Done);
    }
    if labels.contains("ralph:escalated") {
        return Some(RalphStatus::Escalated);
    }
    let queued = labels.contains("ralph:status:queued");
    let blocked = labels.contains("ralph:status:blocked") || labels.contains("ralph:blocked");
    let in_progress = labels.contains("ralph:status:in-progress");
    let paused = labels.contains("ralph:status:paused");

    if let Some(op) = op_state {
        if op.released_at_ms.is_some() && in_progress {
            return Some(RalphStatus::Queued);
        }
    }
    if blocked && !queued {
        return Some(RalphStatus::Blocked);
    }
    if paused {
        return Some(RalphStatus::Paused);
    }
    if in_progress {
        return Some(RalphStatus::InProgress);
    }
    if queued {
        return Some(RalphStatus::Queued);
    }
    None
}

/// A derived view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskView {
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub status: Option<&'static str>,
    pub priority: &'static str,
    pub session_id: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

pub struct DeriveTaskViewInput<'a> {
    pub repo: &'a str,
    pub number: u64,
    pub title: &'a str,
    pub labels: &'a HashSet<String>,
    pub op_state: Option<&'a OpState>,
}

/// Compose status + priority + session into a [`TaskView`].
pub fn derive_task_view(input: DeriveTaskViewInput<'_>) -> TaskView {
    let status = derive_ralph_status(input.labels, input.op_state).map(|s| match s {
        RalphStatus::Queued => "queued",
        RalphStatus::InProgress => "in-progress",
        RalphStatus::Blocked => "blocked",
        RalphStatus::Escalated => "escalated",
        RalphStatus::Done => "done",
        RalphStatus::Stuck => "stuck",
        RalphStatus::Paused => "paused",
    });
    TaskView {
        repo: input.repo.to_string(),
        number: input.number,
        title: input.title.to_string(),
        status,
        priority: Priority::derive(input.labels).as_str(),
        session_id: input.op_state.and_then(|o| o.session_id.clone()),
        heartbeat_at: input.op_state.map(|o| o.heartbeat_at),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStep {
    pub action: ClaimAction,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPlan {
    pub claimable: bool,
    pub steps: Vec<ClaimStep>,
}

/// Plan the label delta to claim a queued issue.
/// Claimable iff `queued` is present and neither `in-progress` nor `done`
/// is present.
pub fn plan_claim(labels: &HashSet<String>) -> ClaimPlan {
    let queued = labels.contains("ralph:status:queued");
    let in_progress = labels.contains("ralph:status:in-progress");
    let done = labels.contains("ralph:status:done") || labels.contains("ralph:done");

    if !queued || in_progress || done {
        return ClaimPlan { claimable: false, steps: Vec::new() };
    }
    let mut steps = vec![ClaimStep { action: ClaimAction::Add, label: "ralph:status:in-progress" }];
    steps.push(ClaimStep { action: ClaimAction::Remove, label: "ralph:status:queued" });
    if labels.contains("ralph:status:blocked") {
        steps.push(ClaimStep { action: ClaimAction::Remove, label: "ralph:status:blocked" });
    }
    ClaimPlan { claimable: true, steps }
}

/// Apply a [`ClaimPlan`]'s steps to a label set, for idempotence testing.
pub fn apply_claim_steps(labels: &HashSet<String>, steps: &[ClaimStep]) -> HashSet<String> {
    let mut next = labels.clone();
    for step in steps {
        match step.action {
            ClaimAction::Add => {
                next.insert(step.label.to_string());
            }
            ClaimAction::Remove => {
                next.remove(step.label);
            }
        }
    }
    next
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Queued,
    InProgress,
    Blocked,
    Escalated,
    Done,
    Paused,
}

impl TargetStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Queued => "ralph:status:queued",
            Self::InProgress => "ralph:status:in-progress",
            Self::Blocked => "ralph:status:blocked",
            Self::Escalated => "ralph:status:escalated",
            Self::Done => "ralph:status:done",
            Self::Paused => "ralph:status:paused",
        }
    }
}

pub const ALL_STATUS_LABELS: [&str; 6] = [
    "ralph:status:queued",
    "ralph:status:in-progress",
    "ralph:status:blocked",
    "ralph:status:escalated",
    "ralph:status:done",
    "ralph:status:paused",
];

/// Every `ralph:*` workflow label the control plane manages, ensured to
/// exist on a repo by C10 before it starts writing them.
pub const ALL_RALPH_WORKFLOW_LABELS: [&str; 13] = [
    "ralph:status:queued",
    "ralph:status:in-progress",
    "ralph:status:blocked",
    "ralph:status:escalated",
    "ralph:status:done",
    "ralph:status:paused",
    "ralph:done",
    "ralph:escalated",
    "p0-critical",
    "p1-high",
    "p2-medium",
    "p3-low",
    "p4-backlog",
];

/// A minimal add/remove delta operating only on `ralph:*` labels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelDelta {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Compute the minimal label delta to move an issue to `target_status`.
///
/// Transitioning to `blocked` preserves `queued` — a blocked task remains
/// queued for priority purposes. Transitioning to `queued` removes `blocked`.
pub fn status_to_ralph_label_delta(target: TargetStatus, labels: &HashSet<String>) -> LabelDelta {
    let target_label = target.label();
    let mut add = Vec::new();
    if !labels.contains(target_label) {
        add.push(target_label.to_string());
    }

    let mut remove: Vec<String> = ALL_STATUS_LABELS
        .iter()
        .filter(|l| **l != target_label && labels.contains(**l))
        .map(|l| l.to_string())
        .collect();

    if target == TargetStatus::Blocked {
        // Keep `queued` even though it's in ALL_STATUS_LABELS.
        remove.retain(|l| l != "ralph:status:queued");
    }
    if target == TargetStatus::Queued {
        remove.retain(|l| l != "ralph:status:blocked" || labels.contains("ralph:status:blocked"));
    }

    LabelDelta { add, remove }
}

/// Whether a stale in-progress lease should be recovered: `true` only when `in-progress` is
/// labeled, an op-state exists, its heartbeat is older than `ttl_ms`, and
/// the op-state has not been voluntarily released.
pub fn should_recover_stale_in_progress(
    labels: &HashSet<String>,
    op_state: Option<&OpState>,
    now: DateTime<Utc>,
    ttl_ms: i64,
) -> bool {
    if !labels.contains("ralph:status:in-progress") {
        return false;
    }
    let Some(op) = op_state else { return false };
    if op.released_at_ms.is_some() {
        return false;
    }
    let age_ms = (now - op.heartbeat_at).num_milliseconds();
    age_ms > ttl_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn op_state(heartbeat_at: DateTime<Utc>, released_at_ms: Option<i64>) -> OpState {
        OpState {
            repo: "o/r".into(),
            issue_number: 1,
            task_path: "tasks/1".into(),
            session_id: Some("s1".into()),
            status: "running".into(),
            heartbeat_at,
            released_at_ms,
        }
    }

    #[test]
    fn done_label_wins_outright() {
        let l = labels(&["ralph:done", "ralph:status:in-progress"]);
        assert_eq!(derive_ralph_status(&l, None), Some(RalphStatus::Done));
    }

    #[test]
    fn escalated_wins_over_queued_and_in_progress() {
        let l = labels(&["ralph:escalated", "ralph:status:queued"]);
        assert_eq!(derive_ralph_status(&l, None), Some(RalphStatus::Escalated));
    }

    #[test]
    fn blocked_requires_no_queued() {
        let blocked_only = labels(&["ralph:status:blocked"]);
        assert_eq!(derive_ralph_status(&blocked_only, None), Some(RalphStatus::Blocked));

        let blocked_and_queued = labels(&["ralph:status:blocked", "ralph:status:queued"]);
        assert_eq!(derive_ralph_status(&blocked_and_queued, None), Some(RalphStatus::Queued));
    }

    #[test]
    fn released_op_state_downgrades_in_progress_to_queued() {
        let l = labels(&["ralph:status:in-progress"]);
        let op = op_state(Utc::now(), Some(1000));
        assert_eq!(derive_ralph_status(&l, Some(&op)), Some(RalphStatus::Queued));
    }

    #[test]
    fn active_op_state_keeps_in_progress() {
        let l = labels(&["ralph:status:in-progress"]);
        let op = op_state(Utc::now(), None);
        assert_eq!(derive_ralph_status(&l, Some(&op)), Some(RalphStatus::InProgress));
    }

    #[test]
    fn priority_derivation_is_case_insensitive_and_tolerates_suffixes() {
        let l = labels(&["P2", "p4 backlog"]);
        assert_eq!(Priority::derive(&l), Priority::P2Medium);
    }

    #[test]
    fn priority_defaults_when_no_priority_label_present() {
        let l = labels(&["ralph:status:queued"]);
        assert_eq!(Priority::derive(&l), Priority::DEFAULT);
    }

    #[test]
    fn priority_picks_highest_among_multiple_labels() {
        let l = labels(&["p3-low", "p1:urgent", "p4-backlog"]);
        assert_eq!(Priority::derive(&l), Priority::P1High);
    }

    #[test]
    fn claim_plan_for_queued_and_blocked() {
        let l = labels(&["ralph:status:queued", "ralph:status:blocked"]);
        let plan = plan_claim(&l);
        assert!(plan.claimable);
        assert_eq!(
            plan.steps,
            vec![
                ClaimStep { action: ClaimAction::Add, label: "ralph:status:in-progress" },
                ClaimStep { action: ClaimAction::Remove, label: "ralph:status:queued" },
                ClaimStep { action: ClaimAction::Remove, label: "ralph:status:blocked" },
            ]
        );
    }

    #[test]
    fn claim_plan_rejects_when_already_in_progress_or_done() {
        assert!(!plan_claim(&labels(&["ralph:status:queued", "ralph:status:in-progress"])).claimable);
        assert!(!plan_claim(&labels(&["ralph:status:queued", "ralph:done"])).claimable);
        assert!(!plan_claim(&labels(&[])).claimable);
    }

    #[test]
    fn claim_plan_is_idempotent_once_applied() {
        let l = labels(&["ralph:status:queued", "ralph:status:blocked"]);
        let plan = plan_claim(&l);
        let next = apply_claim_steps(&l, &plan.steps);
        assert!(!plan_claim(&next).claimable);
    }

    #[test]
    fn status_delta_to_blocked_preserves_queued() {
        let l = labels(&["ralph:status:queued", "ralph:status:in-progress"]);
        let delta = status_to_ralph_label_delta(TargetStatus::Blocked, &l);
        assert_eq!(delta.add, vec!["ralph:status:blocked".to_string()]);
        assert!(!delta.remove.contains(&"ralph:status:queued".to_string()));
        assert!(delta.remove.contains(&"ralph:status:in-progress".to_string()));
    }

    #[test]
    fn status_delta_to_queued_removes_blocked() {
        let l = labels(&["ralph:status:blocked"]);
        let delta = status_to_ralph_label_delta(TargetStatus::Queued, &l);
        assert_eq!(delta.add, vec!["ralph:status:queued".to_string()]);
        assert_eq!(delta.remove, vec!["ralph:status:blocked".to_string()]);
    }

    #[test]
    fn status_delta_is_noop_add_when_target_already_present() {
        let l = labels(&["ralph:status:done"]);
        let delta = status_to_ralph_label_delta(TargetStatus::Done, &l);
        assert!(delta.add.is_empty());
        assert!(delta.remove.is_empty());
    }

    #[test]
    fn stale_in_progress_recovery_requires_all_conditions() {
        let l = labels(&["ralph:status:in-progress"]);
        let now = Utc::now();
        let stale = op_state(now - chrono::Duration::minutes(30), None);
        assert!(should_recover_stale_in_progress(&l, Some(&stale), now, 60_000));

        let fresh = op_state(now - chrono::Duration::seconds(1), None);
        assert!(!should_recover_stale_in_progress(&l, Some(&fresh), now, 60_000));

        let released = op_state(now - chrono::Duration::minutes(30), Some(1));
        assert!(!should_recover_stale_in_progress(&l, Some(&released), now, 60_000));

        assert!(!should_recover_stale_in_progress(&l, None, now, 60_000));

        let no_in_progress = labels(&["ralph:status:queued"]);
        assert!(!should_recover_stale_in_progress(&no_in_progress, Some(&stale), now, 60_000));
    }
}
