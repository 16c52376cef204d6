//! `orchestrator` — the composition root wiring `orchestrator-core`'s
//! components into a runnable daemon.
//!
//! Grounded on `sipag`/`sipag-core`'s split: `sipag-core` stays a pure
//! library, and the thin `sipag` binary is the only place that reads
//! environment/config, opens real I/O (a `gh`-backed gateway, a filesystem
//! state store), and prints operator-facing banners with `println!`. This
//! binary keeps that same division of labor — every decision lives in
//! `orchestrator-core`; this file only reads env vars, builds the concrete
//! collaborators the core's trait seams ask for, and drives a minimal
//! scheduler loop.
//!
//! It does not implement git worktree mechanics, container spawn, or OAuth
//! refresh — those stay external; the worker-lifecycle half of the system
//! (claiming an issue, spawning a worker process, driving it through
//! checkpoints) is out of scope for this demo loop, which only proves the
//! mirror/queue/reconciler/control-plane wiring compiles and runs end to
//! end.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use orchestrator_core::bus::EventBus;
use orchestrator_core::control_plane::{
    build_router, CommandHandlers, CommandOutcome, ControlPlaneConfig, ControlPlaneError, ControlPlaneState,
    IssueCmdRequest, IssuePriorityRequest, MessageEnqueueRequest, SnapshotProvider, TaskPriorityRequest,
    TaskStatusRequest, WorkerTarget,
};
use orchestrator_core::event::{Event, EventType, Level};
use orchestrator_core::github::{GitHubClient, GitHubClientConfig, StaticToken, TokenProvider};
use orchestrator_core::labels::LabelCoordinator;
use orchestrator_core::mirror::{IssueMirror, MirrorConfig};
use orchestrator_core::queue::plan_claim;
use orchestrator_core::reconciler::{DoneReconciler, ReconcilerConfig};
use orchestrator_core::store::memory::InMemoryStore;
use orchestrator_core::store::StateStore;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The closed set of env vars this binary reads. Loading config from a
/// richer source (files, flags) is left to a real deployment.
struct CliConfig {
    github_token: String,
    repos: Vec<String>,
    control_plane_token: String,
    control_plane_host: String,
    control_plane_port: u16,
    base_interval: Duration,
}

impl CliConfig {
    fn from_env() -> Self {
        let repos = std::env::var("ORCHESTRATOR_REPOS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Self {
            github_token: std::env::var("GITHUB_TOKEN").unwrap_or_default(),
            repos,
            control_plane_token: std::env::var("ORCHESTRATOR_CONTROL_TOKEN").unwrap_or_default(),
            control_plane_host: std::env::var("ORCHESTRATOR_CONTROL_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            control_plane_port: std::env::var("ORCHESTRATOR_CONTROL_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4317),
            base_interval: Duration::from_millis(
                std::env::var("ORCHESTRATOR_BASE_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30_000),
            ),
        }
    }
}

/// Serves the event bus's own recent-event window as the dashboard snapshot
/// — a real deployment assembles a richer snapshot (worker roster, run
/// totals) from the scheduler's live state, which this demo loop doesn't
/// model.
struct BusSnapshot {
    bus: Arc<EventBus>,
}

#[async_trait]
impl SnapshotProvider for BusSnapshot {
    async fn snapshot(&self) -> Value {
        let recent = self.bus.get_recent(50);
        json!({
            "subscriberCount": self.bus.subscriber_count(),
            "recentEventCount": recent.len(),
        })
    }
}

/// Logs every command instead of acting on it — there is no worker process
/// or IPC channel in this demo loop to dispatch to. A real deployment wires
/// these methods to the scheduler's worker registry and label coordinator.
struct LoggingCommandHandlers;

#[async_trait]
impl CommandHandlers for LoggingCommandHandlers {
    async fn pause(&self, target: WorkerTarget) -> Result<CommandOutcome, ControlPlaneError> {
        info!(worker_id = %target.worker_id, "command: pause");
        Ok(CommandOutcome::ok_empty())
    }

    async fn resume(&self, target: WorkerTarget) -> Result<CommandOutcome, ControlPlaneError> {
        info!(worker_id = %target.worker_id, "command: resume");
        Ok(CommandOutcome::ok_empty())
    }

    async fn message_enqueue(&self, req: MessageEnqueueRequest) -> Result<CommandOutcome, ControlPlaneError> {
        info!(worker_id = %req.worker_id, "command: message.enqueue");
        Ok(CommandOutcome::Accepted)
    }

    async fn task_priority(&self, req: TaskPriorityRequest) -> Result<CommandOutcome, ControlPlaneError> {
        info!(repo = %req.repo, issue = req.issue_number, priority = %req.priority, "command: task.priority");
        Ok(CommandOutcome::ok_empty())
    }

    async fn task_status(&self, req: TaskStatusRequest) -> Result<CommandOutcome, ControlPlaneError> {
        info!(repo = %req.repo, issue = req.issue_number, status = %req.status, "command: task.status");
        Ok(CommandOutcome::ok_empty())
    }

    async fn issue_priority(&self, req: IssuePriorityRequest) -> Result<CommandOutcome, ControlPlaneError> {
        info!(repo = %req.repo, issue = req.issue_number, priority = %req.priority, "command: issue.priority");
        Ok(CommandOutcome::ok_empty())
    }

    async fn issue_cmd(&self, req: IssueCmdRequest) -> Result<CommandOutcome, ControlPlaneError> {
        info!(repo = %req.repo, issue = req.issue_number, cmd = %req.cmd, "command: issue.cmd");
        Ok(CommandOutcome::ok_empty())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = CliConfig::from_env();
    if config.repos.is_empty() {
        warn!("ORCHESTRATOR_REPOS is empty; the scheduler loop has nothing to poll");
    }

    let bus = Arc::new(EventBus::default());
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let token_provider: Arc<dyn TokenProvider> = Arc::new(StaticToken(config.github_token.clone()));
    let github = Arc::new(GitHubClient::new(token_provider, GitHubClientConfig::default()).with_event_bus(bus.clone()));
    let labels = Arc::new(LabelCoordinator::new(github.clone(), store.clone()));
    let mirror = Arc::new(IssueMirror::new(github.clone(), store.clone(), MirrorConfig::default(), 2));
    let reconciler = Arc::new(DoneReconciler::new(
        github.clone(),
        store.clone(),
        labels.clone(),
        ReconcilerConfig::default(),
        Some(config.repos.iter().cloned().collect::<HashSet<_>>()),
    ));

    bus.publish(Event {
        ts: chrono::Utc::now(),
        event_type: EventType::DaemonStarted,
        level: Level::Info,
        run_id: None,
        worker_id: None,
        repo: None,
        task_id: None,
        session_id: None,
        data: json!({"repos": config.repos}),
    });

    let cancel = CancellationToken::new();

    let control_plane_state = ControlPlaneState {
        bus: bus.clone(),
        config: Arc::new(ControlPlaneConfig {
            token: config.control_plane_token.clone(),
            host: config.control_plane_host.clone(),
            port: config.control_plane_port,
            ..ControlPlaneConfig::default()
        }),
        snapshot: Arc::new(BusSnapshot { bus: bus.clone() }),
        commands: Arc::new(LoggingCommandHandlers),
    };
    let router = build_router(control_plane_state);
    let listen_addr = format!("{}:{}", config.control_plane_host, config.control_plane_port);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding control plane to {listen_addr}"))?;
    info!(addr = %listen_addr, "control plane listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let mut pollers = Vec::new();
    for repo in config.repos.clone() {
        let mirror = mirror.clone();
        let reconciler = reconciler.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        let base_interval = config.base_interval;
        pollers.push(tokio::spawn(async move {
            scheduler_loop_for_repo(repo, mirror, reconciler, store, cancel, base_interval).await;
        }));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    cancel.cancel();

    for poller in pollers {
        let _ = poller.await;
    }
    let _ = server.await;

    bus.publish(Event {
        ts: chrono::Utc::now(),
        event_type: EventType::DaemonStopped,
        level: Level::Info,
        run_id: None,
        worker_id: None,
        repo: None,
        task_id: None,
        session_id: None,
        data: json!({}),
    });

    Ok(())
}

/// One repo's scheduler loop: mirror tick -> queue-state plan (logged, not
/// executed — claiming is the scheduler's job, not this demo's) ->
/// done-reconciler tick -> sleep for the base interval.
async fn scheduler_loop_for_repo(
    repo: String,
    mirror: Arc<IssueMirror>,
    reconciler: Arc<DoneReconciler>,
    store: Arc<dyn StateStore>,
    cancel: CancellationToken,
    base_interval: Duration,
) {
    while !cancel.is_cancelled() {
        let tick_started = std::time::Instant::now();
        match mirror.tick(&repo, &cancel).await {
            Ok(outcome) => {
                info!(repo = %repo, fetched = outcome.fetched, stored = outcome.stored, "mirror tick complete");
                log_intended_claims(&repo, &store).await;
            }
            Err(err) => warn!(repo = %repo, error = %err, "mirror tick failed"),
        }

        if let Err(err) = reconciler.tick(&repo).await {
            warn!(repo = %repo, error = %err, "done-reconciler tick failed");
        }

        tracing::debug!(repo = %repo, elapsed = ?tick_started.elapsed(), "idle telemetry: tick complete");

        tokio::select! {
            _ = tokio::time::sleep(base_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Derive and log (never apply — applying a claim is the scheduler's call,
/// which would also need to spawn a worker process this demo doesn't model)
/// the claim plan for every issue with an active op-state in `repo`.
async fn log_intended_claims(repo: &str, store: &Arc<dyn StateStore>) {
    let op_states = match store.list_task_op_states_by_repo(repo).await {
        Ok(states) => states,
        Err(err) => {
            warn!(repo, error = %err, "could not list op-states for claim planning");
            return;
        }
    };
    for op in op_states {
        let Ok(Some(current_labels)) = store.get_issue_labels(repo, op.issue_number).await else { continue };
        let plan = plan_claim(&current_labels);
        if plan.claimable {
            info!(repo, issue = op.issue_number, steps = ?plan.steps, "issue is claimable");
        }
    }
}
