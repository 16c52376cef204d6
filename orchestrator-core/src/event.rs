//! Event envelope and the closed event-type/payload set.
//!
//! `sipag-core`'s `events` module hand-rolls NDJSON with a tiny
//! string-scanning parser because `sipag` only ever reads its own files back.
//! Here the envelope crosses a wire boundary (control-plane WebSocket,
//! persisted JSONL consumed by other tooling), so we use `serde` end to end
//! and validate payload shape against the event `type` on publish and again
//! on wire egress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Severity carried on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// The closed set of event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "daemon.started")]
    DaemonStarted,
    #[serde(rename = "daemon.stopped")]
    DaemonStopped,
    #[serde(rename = "github.request")]
    GithubRequest,
    #[serde(rename = "worker.created")]
    WorkerCreated,
    #[serde(rename = "worker.became_busy")]
    WorkerBecameBusy,
    #[serde(rename = "worker.became_idle")]
    WorkerBecameIdle,
    #[serde(rename = "worker.checkpoint.reached")]
    WorkerCheckpointReached,
    #[serde(rename = "worker.pause.requested")]
    WorkerPauseRequested,
    #[serde(rename = "worker.pause.reached")]
    WorkerPauseReached,
    #[serde(rename = "worker.pause.cleared")]
    WorkerPauseCleared,
    #[serde(rename = "worker.activity.updated")]
    WorkerActivityUpdated,
    #[serde(rename = "worker.anomaly.updated")]
    WorkerAnomalyUpdated,
    #[serde(rename = "worker.summary.updated")]
    WorkerSummaryUpdated,
    #[serde(rename = "worker.context_compact.triggered")]
    WorkerContextCompactTriggered,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.escalated")]
    TaskEscalated,
    #[serde(rename = "task.blocked")]
    TaskBlocked,
    #[serde(rename = "message.queued")]
    MessageQueued,
    #[serde(rename = "message.detected")]
    MessageDetected,
    #[serde(rename = "message.delivery.attempted")]
    MessageDeliveryAttempted,
    #[serde(rename = "message.delivery.deferred")]
    MessageDeliveryDeferred,
    #[serde(rename = "message.delivery.blocked")]
    MessageDeliveryBlocked,
    #[serde(rename = "log.ralph")]
    LogRalph,
    #[serde(rename = "log.worker")]
    LogWorker,
    #[serde(rename = "log.opencode.event")]
    LogOpencodeEvent,
    #[serde(rename = "log.opencode.text")]
    LogOpencodeText,
    #[serde(rename = "error")]
    Error,
}

impl EventType {
    /// Whether this event type carries raw opencode payloads, which the
    /// control plane filters unless `exposeRawOpencodeEvents` is set.
    pub fn is_raw_opencode(&self) -> bool {
        matches!(self, EventType::LogOpencodeEvent)
    }

    /// `worker.checkpoint.reached.data.checkpoint` must be a recognized
    /// checkpoint string; other types validate their own shape.
    pub fn requires_checkpoint_field(&self) -> bool {
        matches!(
            self,
            EventType::WorkerCheckpointReached
                | EventType::WorkerPauseReached
        )
    }

    pub fn requires_method_path_status(&self) -> bool {
        matches!(self, EventType::GithubRequest)
    }
}

/// Ordered worker lifecycle checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Planned,
    Routed,
    ImplementationStepComplete,
    PrReady,
    MergeStepComplete,
    SurveyComplete,
    Recorded,
}

impl Checkpoint {
    pub const ORDER: [Checkpoint; 7] = [
        Checkpoint::Planned,
        Checkpoint::Routed,
        Checkpoint::ImplementationStepComplete,
        Checkpoint::PrReady,
        Checkpoint::MergeStepComplete,
        Checkpoint::SurveyComplete,
        Checkpoint::Recorded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::Planned => "planned",
            Checkpoint::Routed => "routed",
            Checkpoint::ImplementationStepComplete => "implementation_step_complete",
            Checkpoint::PrReady => "pr_ready",
            Checkpoint::MergeStepComplete => "merge_step_complete",
            Checkpoint::SurveyComplete => "survey_complete",
            Checkpoint::Recorded => "recorded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|c| c.as_str() == s)
    }
}

/// The event envelope. `data` is a validated `Value` rather than a
/// per-variant struct so that unknown-but-well-formed producer payloads
/// (e.g. future fields) round-trip without the bus itself needing to know
/// every downstream consumer's schema — per-type field validation happens
/// in [`validate_payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("worker.checkpoint.reached/pause.reached requires data.checkpoint to be a recognized checkpoint string")]
    MissingOrInvalidCheckpoint,
    #[error("github.request requires data.{{method,path,status,ok,write,durationMs,attempt}}")]
    MissingGithubRequestFields,
}

/// Validate `event.data` against the shape required for its `event_type`.
/// Called on publish by the event bus and again on wire egress by the
/// control plane.
pub fn validate_payload(event: &Event) -> Result<(), EventValidationError> {
    if event.event_type.requires_checkpoint_field() {
        let cp = event.data.get("checkpoint").and_then(Value::as_str);
        if !cp.is_some_and(|s| Checkpoint::parse(s).is_some()) {
            return Err(EventValidationError::MissingOrInvalidCheckpoint);
        }
    }
    if event.event_type.requires_method_path_status() {
        let required = ["method", "path", "status", "ok", "write", "durationMs", "attempt"];
        for field in required {
            if event.data.get(field).is_none() {
                return Err(EventValidationError::MissingGithubRequestFields);
            }
        }
    }
    Ok(())
}

/// Serialize an event to its wire JSON form, after validating it.
///
/// Named to mirror the `safeJsonStringifyRalphEvent` helper this crate's
/// wire format is compatible with.
pub fn safe_json_stringify_ralph_event(event: &Event) -> Result<String, EventValidationError> {
    validate_payload(event)?;
    Ok(serde_json::to_string(event).expect("Event serialization is infallible"))
}

/// Parse a wire JSON string back into an `Event`, returning `None` on any
/// shape mismatch — mirrors the `isRalphEvent` predicate composed with
/// parsing.
pub fn is_ralph_event(json: &str) -> bool {
    parse_ralph_event(json).is_some()
}

pub fn parse_ralph_event(json: &str) -> Option<Event> {
    let event: Event = serde_json::from_str(json).ok()?;
    validate_payload(&event).ok()?;
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_event(event_type: EventType, data: Value) -> Event {
        Event {
            ts: Utc::now(),
            event_type,
            level: Level::Info,
            run_id: None,
            worker_id: Some("w1".into()),
            repo: None,
            task_id: None,
            session_id: None,
            data,
        }
    }

    #[test]
    fn checkpoint_reached_requires_valid_checkpoint_field() {
        let ev = base_event(EventType::WorkerCheckpointReached, json!({"checkpoint": "planned"}));
        assert!(validate_payload(&ev).is_ok());

        let bad = base_event(EventType::WorkerCheckpointReached, json!({"checkpoint": "nope"}));
        assert_eq!(
            validate_payload(&bad),
            Err(EventValidationError::MissingOrInvalidCheckpoint)
        );

        let missing = base_event(EventType::WorkerCheckpointReached, json!({}));
        assert!(validate_payload(&missing).is_err());
    }

    #[test]
    fn github_request_requires_all_telemetry_fields() {
        let ev = base_event(
            EventType::GithubRequest,
            json!({"method":"GET","path":"/repos/o/r/issues","status":200,"ok":true,"write":false,"durationMs":12,"attempt":1}),
        );
        assert!(validate_payload(&ev).is_ok());

        let missing = base_event(EventType::GithubRequest, json!({"method":"GET"}));
        assert_eq!(
            validate_payload(&missing),
            Err(EventValidationError::MissingGithubRequestFields)
        );
    }

    #[test]
    fn other_event_types_have_no_required_fields() {
        let ev = base_event(EventType::TaskAssigned, json!({"anything": true}));
        assert!(validate_payload(&ev).is_ok());
    }

    #[test]
    fn round_trip_through_safe_stringify_and_parse() {
        let ev = base_event(EventType::WorkerCheckpointReached, json!({"checkpoint": "routed"}));
        let s = safe_json_stringify_ralph_event(&ev).unwrap();
        assert!(is_ralph_event(&s));
        let parsed = parse_ralph_event(&s).unwrap();
        assert_eq!(parsed.event_type, EventType::WorkerCheckpointReached);
    }

    #[test]
    fn invalid_payload_is_not_a_ralph_event() {
        let bad = base_event(EventType::WorkerCheckpointReached, json!({"checkpoint": "bogus"}));
        // Bypass validation to produce the wire string directly, simulating
        // a hostile or buggy producer.
        let s = serde_json::to_string(&bad).unwrap();
        assert!(!is_ralph_event(&s));
    }

    #[test]
    fn checkpoint_order_is_stable_and_total() {
        for w in Checkpoint::ORDER.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn checkpoint_parse_round_trips_all_variants() {
        for cp in Checkpoint::ORDER {
            assert_eq!(Checkpoint::parse(cp.as_str()), Some(cp));
        }
        assert_eq!(Checkpoint::parse("unknown"), None);
    }
}
