//! Checkpoint Runtime: per-worker state machine emitting
//! ordered, idempotent checkpoint/pause events.
//!
//! Grounded the same way [`crate::queue`] is — as a pure decision function
//! plus a small persisted-state struct, in the shape of `sipag-core`'s
//! `worker::decision` module, generalized from "one-shot action decision" to
//! "state machine transition producing an ordered effect list" because a
//! pause cycle must produce exactly four events in a fixed order, not just
//! a single decision.

use crate::event::Checkpoint;

/// Per-worker checkpoint/pause state.
///
/// Invariant: `paused_at_checkpoint.is_some() => pause_requested`. Enforced
/// by construction — every transition in this module either sets both
/// together or clears both together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointState {
    pub last_checkpoint: Option<Checkpoint>,
    pub checkpoint_seq: u64,
    pub paused_at_checkpoint: Option<Checkpoint>,
    pub pause_requested: bool,
}

impl CheckpointState {
    fn with_invariant(self) -> Self {
        debug_assert!(self.paused_at_checkpoint.is_none() || self.pause_requested);
        self
    }
}

/// One emitted effect from a checkpoint/pause transition, in the exact
/// order they must be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Persist(CheckpointState),
    Emit(EmittedEvent),
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEvent {
    pub kind: EventKind,
    pub checkpoint: Option<Checkpoint>,
    /// Idempotency key: `<eventType>:<workerId>:<checkpoint|"">:<checkpointSeq>`
    ///, safely re-entrant after a crash mid-emit.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckpointReached,
    PauseRequested,
    PauseReached,
    PauseCleared,
}

impl EventKind {
    fn event_type_str(self) -> &'static str {
        match self {
            Self::CheckpointReached => "worker.checkpoint.reached",
            Self::PauseRequested => "worker.pause.requested",
            Self::PauseReached => "worker.pause.reached",
            Self::PauseCleared => "worker.pause.cleared",
        }
    }
}

fn idempotency_key(worker_id: &str, kind: EventKind, checkpoint: Option<Checkpoint>, seq: u64) -> String {
    let cp = checkpoint.map(Checkpoint::as_str).unwrap_or("");
    format!("{}:{worker_id}:{cp}:{seq}", kind.event_type_str())
}

fn emitted(worker_id: &str, kind: EventKind, checkpoint: Option<Checkpoint>, seq: u64) -> Effect {
    Effect::Emit(EmittedEvent {
        kind,
        checkpoint,
        idempotency_key: idempotency_key(worker_id, kind, checkpoint, seq),
    })
}

/// If `pause_at_checkpoint` is set, the runtime only actually waits when the
/// incoming checkpoint matches it; any other checkpoint still records pause
/// *intent* without mutating
/// `pause_requested` or invoking the wait callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointConfig {
    pub pause_at_checkpoint: Option<Checkpoint>,
}

/// Drive one `checkpoint reached` transition. `worker_id` feeds idempotency keys only; ordering and state
/// transitions are pure.
pub fn apply_checkpoint_reached(
    worker_id: &str,
    state: CheckpointState,
    checkpoint: Checkpoint,
    pause_requested: bool,
    config: CheckpointConfig,
) -> Vec<Effect> {
    if pause_requested && state.paused_at_checkpoint == Some(checkpoint) {
        // Already parked at this exact checkpoint: nothing new to emit, just
        // wait again. checkpoint_seq does not advance.
        return vec![Effect::Wait];
    }

    let gated_pause = config
        .pause_at_checkpoint
        .is_some_and(|target| target != checkpoint);

    let next_seq = state.checkpoint_seq + 1;
    let entering_pause = pause_requested && !state.pause_requested;

    let next_state = if gated_pause {
        // Pause intent is recorded via the emitted events below, but the
        // persisted state does not change: we are not actually pausing at
        // a checkpoint other than the configured one.
        CheckpointState {
            last_checkpoint: Some(checkpoint),
            checkpoint_seq: next_seq,
            ..state
        }
        .with_invariant()
    } else {
        CheckpointState {
            last_checkpoint: Some(checkpoint),
            checkpoint_seq: next_seq,
            paused_at_checkpoint: if pause_requested { Some(checkpoint) } else { None },
            pause_requested,
        }
        .with_invariant()
    };

    let mut effects = vec![
        Effect::Persist(next_state),
        emitted(worker_id, EventKind::CheckpointReached, Some(checkpoint), next_seq),
    ];

    if entering_pause {
        effects.push(emitted(worker_id, EventKind::PauseRequested, None, next_seq));
    }

    if pause_requested && !gated_pause {
        effects.push(emitted(worker_id, EventKind::PauseReached, Some(checkpoint), next_seq));
        effects.push(Effect::Wait);
    }
    // gated_pause: intent was already recorded above (via `entering_pause`,
    // which stays true on every gated call since `pause_requested` is never
    // persisted in that branch) — no wait, no second emission.

    effects
}

/// Drive a `pause cleared` transition.
/// A no-op (empty effect list) if there was nothing to clear.
pub fn apply_pause_cleared(worker_id: &str, state: CheckpointState) -> Vec<Effect> {
    if state.paused_at_checkpoint.is_none() {
        return Vec::new();
    }
    let next_state = CheckpointState {
        paused_at_checkpoint: None,
        pause_requested: false,
        ..state
    }
    .with_invariant();
    vec![
        Effect::Persist(next_state),
        emitted(worker_id, EventKind::PauseCleared, None, state.checkpoint_seq),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(effects: &[Effect]) -> Vec<EventKind> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev.kind),
                _ => None,
            })
            .collect()
    }

    /// S1 — Pause cycle: fresh state, reaches `planned` with pause
    /// requested, then cleared. Observable event order is exactly
    /// checkpoint.reached, pause.requested, pause.reached, (wait),
    /// pause.cleared.
    #[test]
    fn full_pause_cycle_emits_events_in_fixed_order() {
        let state = CheckpointState::default();
        let reached = apply_checkpoint_reached("w1", state, Checkpoint::Planned, true, CheckpointConfig::default());

        assert_eq!(
            kinds(&reached),
            vec![EventKind::CheckpointReached, EventKind::PauseRequested, EventKind::PauseReached]
        );
        assert!(matches!(reached.last(), Some(Effect::Wait)));

        let Effect::Persist(persisted) = reached[0] else { panic!("expected persist first") };
        assert_eq!(persisted.paused_at_checkpoint, Some(Checkpoint::Planned));
        assert!(persisted.pause_requested);
        assert_eq!(persisted.checkpoint_seq, 1);

        let cleared = apply_pause_cleared("w1", persisted);
        assert_eq!(kinds(&cleared), vec![EventKind::PauseCleared]);
        let Effect::Persist(after_clear) = cleared[0] else { panic!("expected persist first") };
        assert_eq!(after_clear.paused_at_checkpoint, None);
        assert!(!after_clear.pause_requested);
    }

    #[test]
    fn checkpoint_seq_does_not_advance_while_already_paused_at_same_checkpoint() {
        let state = CheckpointState {
            last_checkpoint: Some(Checkpoint::Planned),
            checkpoint_seq: 1,
            paused_at_checkpoint: Some(Checkpoint::Planned),
            pause_requested: true,
        };
        let effects = apply_checkpoint_reached("w1", state, Checkpoint::Planned, true, CheckpointConfig::default());
        assert_eq!(effects, vec![Effect::Wait]);
    }

    #[test]
    fn no_pause_requested_only_emits_checkpoint_reached() {
        let state = CheckpointState::default();
        let effects = apply_checkpoint_reached("w1", state, Checkpoint::Routed, false, CheckpointConfig::default());
        assert_eq!(kinds(&effects), vec![EventKind::CheckpointReached]);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Wait)));
    }

    #[test]
    fn pause_cleared_on_unpaused_state_is_a_noop() {
        let state = CheckpointState::default();
        assert!(apply_pause_cleared("w1", state).is_empty());
    }

    #[test]
    fn idempotency_keys_are_stable_per_event_type_worker_checkpoint_and_seq() {
        let state = CheckpointState::default();
        let effects = apply_checkpoint_reached("w1", state, Checkpoint::Planned, false, CheckpointConfig::default());
        let Some(Effect::Emit(ev)) = effects.get(1) else { panic!() };
        assert_eq!(ev.idempotency_key, "worker.checkpoint.reached:w1:planned:1");
    }

    #[test]
    fn pause_at_specific_checkpoint_records_intent_without_waiting_elsewhere() {
        let state = CheckpointState::default();
        let config = CheckpointConfig { pause_at_checkpoint: Some(Checkpoint::PrReady) };
        let effects = apply_checkpoint_reached("w1", state, Checkpoint::Planned, true, config);

        assert_eq!(kinds(&effects), vec![EventKind::CheckpointReached, EventKind::PauseRequested]);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Wait)));
        let Effect::Persist(persisted) = effects[0] else { panic!() };
        assert_eq!(persisted.paused_at_checkpoint, None);
        assert!(!persisted.pause_requested);
    }

    #[test]
    fn pause_at_specific_checkpoint_waits_when_checkpoint_matches() {
        let state = CheckpointState::default();
        let config = CheckpointConfig { pause_at_checkpoint: Some(Checkpoint::PrReady) };
        let effects = apply_checkpoint_reached("w1", state, Checkpoint::PrReady, true, config);
        assert!(effects.iter().any(|e| matches!(e, Effect::Wait)));
    }

    #[test]
    fn checkpoint_seq_is_monotonic_across_repeated_checkpoints() {
        let mut state = CheckpointState::default();
        for cp in [Checkpoint::Planned, Checkpoint::Routed, Checkpoint::ImplementationStepComplete] {
            let effects = apply_checkpoint_reached("w1", state, cp, false, CheckpointConfig::default());
            let Effect::Persist(next) = effects[0] else { panic!() };
            assert!(next.checkpoint_seq > state.checkpoint_seq);
            state = next;
        }
        assert_eq!(state.checkpoint_seq, 3);
    }
}
