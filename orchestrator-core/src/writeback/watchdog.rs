//! Watchdog writeback.
//!
//! Reading the session events file itself (tail-read up to 64 kB) is a
//! filesystem concern left to the composition root; this module takes the
//! already-tailed lines and only owns the kind/label/body policy and the
//! bounded selection of which lines to surface.

use crate::redact::redact_default;

use super::engine::{cap_body_bytes, WritebackPlan};
use super::marker::derive_marker_id;

/// Open question resolved here: a watchdog-stuck issue keeps the
/// in-progress label rather than gaining a distinct `ralph:status:stuck`
/// one (see DESIGN.md).
pub const RALPH_LABEL_STUCK: &str = "ralph:status:in-progress";

const MAX_EVENT_LINES: usize = 50;
const WATCHDOG_BODY_CAP_BYTES: usize = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    /// First timeout: worker gets one retry with a fresh session.
    Stuck,
    /// Second timeout: escalate for human attention.
    Escalated,
}

impl WatchdogKind {
    fn marker_kind(self) -> &'static str {
        match self {
            Self::Stuck => "watchdog-stuck",
            Self::Escalated => "watchdog",
        }
    }
}

/// Select the bounded, redacted tail of recent event lines to surface,
/// preferring anomaly/error lines for the final "last snippet" section.
fn select_event_lines(recent_event_lines: &[String]) -> (Vec<String>, Option<String>) {
    let tail: Vec<String> = recent_event_lines
        .iter()
        .rev()
        .take(MAX_EVENT_LINES)
        .rev()
        .map(|l| redact_default(l))
        .collect();
    let last_snippet = tail
        .iter()
        .rev()
        .find(|l| l.contains("anomaly") || l.contains("error"))
        .cloned()
        .or_else(|| tail.last().cloned());
    (tail, last_snippet)
}

pub fn plan_watchdog(
    repo: &str,
    issue_number: u64,
    kind: WatchdogKind,
    session_id: &str,
    recent_event_lines: &[String],
) -> WritebackPlan {
    let base = format!("{}|{repo}|{issue_number}|{session_id}", kind.marker_kind());
    let marker_id = derive_marker_id(&base);
    let marker = format!("<!-- ralph-{}:id={marker_id} -->", kind.marker_kind());

    let (tail, last_snippet) = select_event_lines(recent_event_lines);
    let retry_note = match kind {
        WatchdogKind::Stuck => "This worker appears stuck; it will retry once with a fresh session.",
        WatchdogKind::Escalated => "This worker is still stuck after one retry and has been escalated.",
    };

    let mut body = format!("{marker}\n{retry_note}\n\n**Recent events:**\n```\n{}\n```\n", tail.join("\n"));
    if let Some(snippet) = last_snippet {
        body.push_str(&format!("\n**Last snippet:**\n```\n{snippet}\n```\n"));
    }
    let body = cap_body_bytes(&body, WATCHDOG_BODY_CAP_BYTES);

    let (add_labels, remove_labels) = match kind {
        WatchdogKind::Stuck => (vec![RALPH_LABEL_STUCK.to_string()], Vec::new()),
        WatchdogKind::Escalated => (
            vec!["ralph:status:escalated".to_string()],
            vec!["ralph:status:in-progress".to_string(), "ralph:status:queued".to_string()],
        ),
    };

    WritebackPlan {
        marker,
        marker_id: marker_id.clone(),
        comment_body: body,
        add_labels,
        remove_labels,
        idempotency_key: format!("watchdog:{repo}#{issue_number}:{marker_id}"),
        scope: format!("watchdog.{}", kind.marker_kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_kind_keeps_in_progress_label() {
        let plan = plan_watchdog("o/r", 1, WatchdogKind::Stuck, "s1", &[]);
        assert_eq!(plan.add_labels, vec![RALPH_LABEL_STUCK.to_string()]);
        assert!(plan.comment_body.contains("retry once"));
    }

    #[test]
    fn escalated_kind_moves_to_escalated_label() {
        let plan = plan_watchdog("o/r", 1, WatchdogKind::Escalated, "s1", &[]);
        assert_eq!(plan.add_labels, vec!["ralph:status:escalated".to_string()]);
        assert!(plan.remove_labels.contains(&"ralph:status:in-progress".to_string()));
    }

    #[test]
    fn last_snippet_prefers_anomaly_or_error_lines() {
        let lines = vec![
            "info: starting step".to_string(),
            "anomaly: unexpected tool call".to_string(),
            "info: continuing".to_string(),
        ];
        let plan = plan_watchdog("o/r", 1, WatchdogKind::Stuck, "s1", &lines);
        assert!(plan.comment_body.contains("Last snippet"));
        assert!(plan.comment_body.contains("unexpected tool call"));
    }

    #[test]
    fn event_lines_are_bounded_and_redacted() {
        let lines: Vec<String> = (0..200).map(|i| format!("line {i} token ghp_{}", "x".repeat(40))).collect();
        let plan = plan_watchdog("o/r", 1, WatchdogKind::Stuck, "s1", &lines);
        assert!(!plan.comment_body.contains("ghp_xxxx"));
        assert!(plan.comment_body.contains("line 199"));
        assert!(!plan.comment_body.contains("line 0 "));
    }
}
