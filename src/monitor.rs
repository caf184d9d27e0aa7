//! C7: per-session supervisor that watches a dispatched agent's chat session
//! and promotes the task when the Completion Gate accepts a reply.
//!
//! Grounded in the teacher's `AgentOrchestrator::run` (`agents/orchestrator/mod.rs`),
//! which runs `task_processor`/`result_processor`/`cleanup_processor` concurrently
//! via `tokio::select!` inside one long-lived task per concern; here the unit of
//! concurrency is one long-lived task per *monitored session* instead, spawned
//! and aborted from a registry the way the teacher's `StatusManager`
//! (`status_manager.rs`) centralizes agent/task status under one guarded map.
//!
//! Poll, idle and ack timers are folded into a single tick loop rather than
//! three independent timers: the poll cadence (10s) is far finer than the
//! idle (600s) and ack (90s) windows, so checking both deadlines once per
//! poll tick is indistinguishable to an external observer from running three
//! separate timers, and it avoids juggling three cancellation handles per
//! monitor.

use crate::completion_gate::{self, CompletionInput};
use crate::constants::{self, IDLE_TIMEOUT_MS, POLL_INTERVAL_MS};
use crate::events::{Event, EventBus, EventKind};
use crate::gateway::GatewayAdapter;
use crate::models::{AuthorType, Comment, Task, TaskPatch, TaskStatus};
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

/// What the Monitor does once the Completion Gate accepts a reply. Kept as a
/// trait so the registry never has to name the Orchestrator or Dispatcher
/// concretely — `MissionControl` wires the real implementation in after
/// construction via `MonitorRegistry::set_handoff`.
#[async_trait]
pub trait HandoffRouter: Send + Sync {
    async fn handle_completion(&self, task_id: &str, was_tester_completion: bool) -> crate::Result<()>;
}

#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub task_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub last_message_count: u32,
    pub last_activity_at: DateTime<Utc>,
    pub dispatch_id: String,
    pub dispatch_started_at: DateTime<Utc>,
    pub baseline_assistant_count: u32,
    pub first_activity_acked: bool,
}

pub struct StartMonitorParams {
    pub task_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub dispatch_id: String,
    pub dispatch_started_at: DateTime<Utc>,
    pub baseline_assistant_count: u32,
}

struct ActiveEntry {
    snapshot: Arc<Mutex<MonitorSnapshot>>,
    join: JoinHandle<()>,
}

/// Process-wide singleton. `stop` is idempotent; `get_active_monitors` is a
/// snapshot read, never blocking a monitor loop for long.
pub struct MonitorRegistry {
    store: Arc<dyn Store>,
    gateway: Arc<dyn GatewayAdapter>,
    state_machine: Arc<StateMachine>,
    events: EventBus,
    handoff: OnceCell<Arc<dyn HandoffRouter>>,
    active: Mutex<HashMap<String, ActiveEntry>>,
}

impl MonitorRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn GatewayAdapter>,
        state_machine: Arc<StateMachine>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            state_machine,
            events,
            handoff: OnceCell::new(),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Must be called exactly once during application startup, before any
    /// monitor is started (the handoff router generally closes over the
    /// Dispatcher and Orchestrator, which in turn depend on this registry).
    pub fn set_handoff(&self, handoff: Arc<dyn HandoffRouter>) {
        let _ = self.handoff.set(handoff);
    }

    pub async fn is_active(&self, task_id: &str, agent_id: &str) -> bool {
        let active = self.active.lock().await;
        active
            .values()
            .any(|e| {
                let snap = e.snapshot.try_lock();
                match snap {
                    Ok(s) => s.task_id == task_id && s.agent_id == agent_id,
                    Err(_) => false,
                }
            })
    }

    pub async fn get_active_monitors(&self) -> Vec<MonitorSnapshot> {
        let active = self.active.lock().await;
        let mut out = Vec::with_capacity(active.len());
        for entry in active.values() {
            out.push(entry.snapshot.lock().await.clone());
        }
        out
    }

    /// Idempotent: stops any existing monitor for the same session key
    /// before starting the new one.
    pub async fn start(self: &Arc<Self>, params: StartMonitorParams) {
        self.stop(&params.session_key).await;

        let snapshot = Arc::new(Mutex::new(MonitorSnapshot {
            task_id: params.task_id.clone(),
            session_key: params.session_key.clone(),
            agent_id: params.agent_id.clone(),
            started_at: Utc::now(),
            last_message_count: params.baseline_assistant_count,
            last_activity_at: Utc::now(),
            dispatch_id: params.dispatch_id.clone(),
            dispatch_started_at: params.dispatch_started_at,
            baseline_assistant_count: params.baseline_assistant_count,
            first_activity_acked: false,
        }));

        let registry = self.clone();
        let session_key = params.session_key.clone();
        let task_snapshot = snapshot.clone();
        let join = tokio::spawn(async move {
            registry.run(task_snapshot).await;
        });

        let mut active = self.active.lock().await;
        active.insert(session_key, ActiveEntry { snapshot, join });
    }

    pub async fn stop(&self, session_key: &str) {
        let mut active = self.active.lock().await;
        if let Some(entry) = active.remove(session_key) {
            entry.join.abort();
        }
    }

    fn handoff_router(&self) -> Arc<dyn HandoffRouter> {
        self.handoff
            .get()
            .cloned()
            .expect("handoff router must be configured before monitors start")
    }

    /// Records an accepted completion and fires the post-acceptance handoff
    /// (§4.7's "Handoff after acceptance"). Shared by the running poll loop
    /// (`tick`) and the one-shot `check_once` used by the
    /// `GET /tasks/check-completion` endpoint — both must record and route
    /// an acceptance identically.
    async fn accept_completion(&self, task: &Task, text: &str, decision: &crate::completion_gate::CompletionDecision) {
        let _ = self
            .store
            .add_comment(Comment::new(
                task.id.clone(),
                AuthorType::Agent,
                task.assigned_agent_id.clone(),
                text.to_string(),
            ))
            .await;
        let _ = self
            .store
            .log_activity(crate::models::ActivityEntry::new(
                "task_completion_accepted",
                Some(task.id.clone()),
                task.assigned_agent_id.clone(),
                "completion gate accepted reply",
                json!({
                    "dispatchId": decision.dispatch_id,
                    "payloadDispatchId": decision.payload_dispatch_id,
                    "evidenceTimestamp": decision.evidence_timestamp,
                    "completionReason": decision.completion_reason.as_str(),
                }),
            ))
            .await;
        let was_tester_completion = task.status == TaskStatus::Testing;
        let handoff = self.handoff_router();
        let task_id_for_handoff = task.id.clone();
        tokio::spawn(async move {
            let _ = handoff.handle_completion(&task_id_for_handoff, was_tester_completion).await;
        });
        self.events
            .publish(Event::new(EventKind::TaskUpdated, json!({ "taskId": task.id })));
    }

    /// One-shot completion check used by `GET /tasks/check-completion`
    /// (§6): polls the task's session exactly once and applies the
    /// Completion Gate, without the timer/ack bookkeeping a running
    /// `Monitor` would do. Returns whether the reply was accepted.
    pub async fn check_once(&self, task_id: &str) -> crate::Result<bool> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Testing) {
            return Ok(false);
        }
        let session_key = if task.status == TaskStatus::Testing {
            task.tester_session_key.clone()
        } else {
            task.openclaw_session_key.clone()
        };
        let Some(session_key) = session_key else {
            return Ok(false);
        };

        let history = self.gateway.get_chat_history(&session_key).await?;
        let assistant_count = history.iter().filter(|m| m.is_assistant()).count() as u32;
        let Some(latest) = history.iter().filter(|m| m.is_assistant()).last() else {
            return Ok(false);
        };

        let now = Utc::now();
        let text = latest.text();
        let marker = completion_gate::detect_marker(&text);
        let decision = completion_gate::evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: marker.extracted_dispatch_id.clone(),
                has_completion_marker: marker.has_completion_marker,
                evidence_timestamp: latest.timestamp.or(Some(now)),
                assistant_message_count: assistant_count,
                now,
            },
        );

        if decision.accepted {
            self.stop(&session_key).await;
            self.accept_completion(&task, &text, &decision).await;
            return Ok(true);
        }

        if completion_gate::has_plausible_completion_language(&text) {
            let _ = self
                .store
                .log_activity(crate::models::ActivityEntry::new(
                    "task_completion_gate_rejected",
                    Some(task_id.to_string()),
                    task.assigned_agent_id.clone(),
                    format!("completion gate rejected: {}", decision.completion_reason.as_str()),
                    json!({ "completionReason": decision.completion_reason.as_str() }),
                ))
                .await;
        }
        Ok(false)
    }

    async fn run(self: Arc<Self>, snapshot: Arc<Mutex<MonitorSnapshot>>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(POLL_INTERVAL_MS));
        let mut events = self.gateway.subscribe_events();
        let session_key = snapshot.lock().await.session_key.clone();
        let mut last_rejected_signature: Option<String> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.tick(&snapshot, &mut last_rejected_signature).await {
                        self.stop(&session_key).await;
                        return;
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(ev) => self.maybe_ack_from_event(&snapshot, &ev).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            // Gateway dropped its event sender; fall back entirely to polling.
                        }
                    }
                }
            }
        }
    }

    async fn maybe_ack_from_event(
        &self,
        snapshot: &Arc<Mutex<MonitorSnapshot>>,
        event: &crate::gateway::GatewayEvent,
    ) {
        let (task_id, session_key, already_acked) = {
            let snap = snapshot.lock().await;
            (snap.task_id.clone(), snap.session_key.clone(), snap.first_activity_acked)
        };
        if already_acked || !event.qualifies_as_first_activity(&session_key) {
            return;
        }
        self.ack_first_activity(&task_id, snapshot).await;
    }

    async fn ack_first_activity(&self, task_id: &str, snapshot: &Arc<Mutex<MonitorSnapshot>>) {
        {
            let mut snap = snapshot.lock().await;
            if snap.first_activity_acked {
                return;
            }
            snap.first_activity_acked = true;
        }
        let Ok(Some(task)) = self.store.get_task(task_id).await else {
            return;
        };
        if task.status == TaskStatus::Testing {
            return;
        }
        let _ = self
            .state_machine
            .transition(
                task_id,
                TaskStatus::InProgress,
                TransitionOptions::new("monitor", "first agent activity acknowledged"),
            )
            .await;
        let _ = self
            .store
            .log_activity(crate::models::ActivityEntry::new(
                "first_agent_activity_ack",
                Some(task_id.to_string()),
                task.assigned_agent_id.clone(),
                "agent produced its first activity",
                json!({}),
            ))
            .await;
    }

    /// One poll tick. Returns `false` when the monitor should stop.
    async fn tick(
        &self,
        snapshot: &Arc<Mutex<MonitorSnapshot>>,
        last_rejected_signature: &mut Option<String>,
    ) -> bool {
        let (task_id, session_key) = {
            let snap = snapshot.lock().await;
            (snap.task_id.clone(), snap.session_key.clone())
        };

        let Ok(Some(task)) = self.store.get_task(&task_id).await else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Testing) {
            return false;
        }

        let now = Utc::now();
        if self.check_ack_timeout(&task, snapshot, now).await {
            return false;
        }
        self.check_idle_timeout(&task, snapshot, now).await;

        let Ok(history) = self.gateway.get_chat_history(&session_key).await else {
            // Transient read error: log and keep polling.
            return true;
        };
        let assistant_count = history.iter().filter(|m| m.is_assistant()).count() as u32;

        let grew = {
            let mut snap = snapshot.lock().await;
            let grew = assistant_count > snap.last_message_count;
            if grew {
                snap.last_activity_at = now;
            }
            snap.last_message_count = assistant_count;
            grew
        };
        if !grew {
            return true;
        }

        if !snapshot.lock().await.first_activity_acked {
            self.ack_first_activity(&task_id, snapshot).await;
        }

        let Some(latest) = history.iter().filter(|m| m.is_assistant()).last() else {
            return true;
        };
        let text = latest.text();
        let marker = completion_gate::detect_marker(&text);

        let decision = completion_gate::evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: marker.extracted_dispatch_id.clone(),
                has_completion_marker: marker.has_completion_marker,
                evidence_timestamp: latest.timestamp.or(Some(now)),
                assistant_message_count: assistant_count,
                now,
            },
        );

        if decision.accepted {
            self.stop(&session_key).await;
            self.accept_completion(&task, &text, &decision).await;
            return false;
        }

        if completion_gate::has_plausible_completion_language(&text) {
            if last_rejected_signature.as_deref() != Some(text.as_str()) {
                *last_rejected_signature = Some(text.clone());
                let _ = self
                    .store
                    .log_activity(crate::models::ActivityEntry::new(
                        "task_completion_gate_rejected",
                        Some(task_id.clone()),
                        task.assigned_agent_id.clone(),
                        format!("completion gate rejected: {}", decision.completion_reason.as_str()),
                        json!({ "completionReason": decision.completion_reason.as_str() }),
                    ))
                    .await;
            }
        }

        true
    }

    async fn check_ack_timeout(&self, task: &Task, snapshot: &Arc<Mutex<MonitorSnapshot>>, now: DateTime<Utc>) -> bool {
        let (acked, started_at) = {
            let snap = snapshot.lock().await;
            (snap.first_activity_acked, snap.started_at)
        };
        if acked || !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return false;
        }
        let ack_timeout = constants::first_activity_ack_timeout_ms();
        let elapsed = now.signed_duration_since(started_at).num_milliseconds().max(0) as u64;
        if elapsed < ack_timeout {
            return false;
        }

        let _ = self
            .state_machine
            .transition(
                &task.id,
                TaskStatus::Assigned,
                TransitionOptions::new("monitor", "no first activity within ack timeout")
                    .bypassing_guards()
                    .with_patch(TaskPatch {
                        dispatch_id: Some(None),
                        dispatch_started_at: Some(None),
                        dispatch_message_count_start: Some(0),
                        ..Default::default()
                    }),
            )
            .await;
        let _ = self
            .store
            .add_comment(Comment::new(
                task.id.clone(),
                AuthorType::System,
                None,
                "agent did not acknowledge the task within the expected window".into(),
            ))
            .await;
        let _ = self
            .store
            .log_activity(crate::models::ActivityEntry::new(
                "task_ack_timeout",
                Some(task.id.clone()),
                task.assigned_agent_id.clone(),
                "no first activity ack within timeout",
                json!({}),
            ))
            .await;
        true
    }

    async fn check_idle_timeout(&self, task: &Task, snapshot: &Arc<Mutex<MonitorSnapshot>>, now: DateTime<Utc>) {
        let should_fire = {
            let mut snap = snapshot.lock().await;
            let idle_for = now.signed_duration_since(snap.last_activity_at).num_milliseconds().max(0) as u64;
            let fire = idle_for >= IDLE_TIMEOUT_MS;
            if fire {
                snap.last_activity_at = now;
            }
            fire
        };
        if !should_fire {
            return;
        }
        let _ = self
            .store
            .add_comment(Comment::new(
                task.id.clone(),
                AuthorType::System,
                None,
                "completion monitor timeout — re-dispatch/rework may be needed".into(),
            ))
            .await;
        let _ = self
            .store
            .log_activity(crate::models::ActivityEntry::new(
                "task_completion_gate_rejected",
                Some(task.id.clone()),
                task.assigned_agent_id.clone(),
                "idle timeout with no new assistant activity",
                json!({ "completionReason": "rejected_suspicious_instant_no_new_evidence" }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::gateway::{GatewayEvent, Message, MessageContent};
    use crate::models::{Priority, Task};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct StubGateway {
        history: Mutex<Vec<Message>>,
        events: broadcast::Sender<GatewayEvent>,
    }

    impl StubGateway {
        fn new() -> Self {
            let (events, _) = broadcast::channel(16);
            Self { history: Mutex::new(Vec::new()), events }
        }

        async fn push_assistant(&self, text: &str) {
            self.history.lock().await.push(Message {
                role: "assistant".into(),
                content: MessageContent::Text(text.into()),
                timestamp: Some(Utc::now()),
            });
        }
    }

    #[async_trait]
    impl GatewayAdapter for StubGateway {
        async fn connect(&self) -> crate::Result<()> {
            Ok(())
        }
        async fn send_message(&self, _session_key: &str, _text: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn patch_session(&self, _session_key: &str, _patch: serde_json::Value) -> crate::Result<()> {
            Ok(())
        }
        async fn get_chat_history(&self, _session_key: &str) -> crate::Result<Vec<Message>> {
            Ok(self.history.lock().await.clone())
        }
        fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
            self.events.subscribe()
        }
        async fn list_sessions(&self) -> crate::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_cron_jobs(&self) -> crate::Result<Vec<serde_json::Value>> {
            Ok(vec![])
        }
        async fn cron_status(&self) -> crate::Result<serde_json::Value> {
            Ok(json!({}))
        }
    }

    struct CountingHandoff {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HandoffRouter for CountingHandoff {
        async fn handle_completion(&self, _task_id: &str, _was_tester_completion: bool) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup() -> (Arc<MonitorRegistry>, Arc<dyn Store>, Arc<StubGateway>, Task) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StubGateway::new());
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));

        let mut task = Task::new("t".into(), None, Priority::Low);
        task.status = TaskStatus::Assigned;
        task.assigned_agent_id = Some("agent-1".into());
        task.dispatch_id = Some("d1".into());
        task.dispatch_started_at = Some(Utc::now());
        task.openclaw_session_key = Some("session-1".into());
        let task = store.create_task(task).await.unwrap();

        let gateway_dyn: Arc<dyn GatewayAdapter> = gateway.clone();
        let registry = MonitorRegistry::new(store.clone(), gateway_dyn, state_machine, EventBus::new());
        registry.set_handoff(Arc::new(CountingHandoff { calls: AtomicUsize::new(0) }));
        (registry, store, gateway, task)
    }

    #[tokio::test]
    async fn is_active_reflects_started_monitor() {
        let (registry, _store, _gateway, task) = setup().await;
        assert!(!registry.is_active(&task.id, "agent-1").await);

        registry
            .start(StartMonitorParams {
                task_id: task.id.clone(),
                session_key: task.openclaw_session_key.clone().unwrap(),
                agent_id: "agent-1".into(),
                dispatch_id: "d1".into(),
                dispatch_started_at: Utc::now(),
                baseline_assistant_count: 0,
            })
            .await;

        assert!(registry.is_active(&task.id, "agent-1").await);
        registry.stop(&task.openclaw_session_key.clone().unwrap()).await;
        assert!(!registry.is_active(&task.id, "agent-1").await);
    }

    #[tokio::test]
    async fn start_is_idempotent_per_session_key() {
        let (registry, _store, _gateway, task) = setup().await;
        let session_key = task.openclaw_session_key.clone().unwrap();
        let params = || StartMonitorParams {
            task_id: task.id.clone(),
            session_key: session_key.clone(),
            agent_id: "agent-1".into(),
            dispatch_id: "d1".into(),
            dispatch_started_at: Utc::now(),
            baseline_assistant_count: 0,
        };
        registry.start(params()).await;
        registry.start(params()).await;
        let active = registry.get_active_monitors().await;
        assert_eq!(active.iter().filter(|m| m.session_key == session_key).count(), 1);
        registry.stop(&session_key).await;
    }

    #[tokio::test]
    async fn tick_accepts_completion_and_stops_monitor() {
        let (registry, store, gateway, task) = setup().await;
        let session_key = task.openclaw_session_key.clone().unwrap();
        gateway.push_assistant("TASK_COMPLETE dispatch_id=d1: all done here").await;

        let snapshot = Arc::new(Mutex::new(MonitorSnapshot {
            task_id: task.id.clone(),
            session_key: session_key.clone(),
            agent_id: "agent-1".into(),
            started_at: Utc::now(),
            last_message_count: 0,
            last_activity_at: Utc::now() - chrono::Duration::seconds(30),
            dispatch_id: "d1".into(),
            dispatch_started_at: task.dispatch_started_at.unwrap(),
            baseline_assistant_count: 0,
            first_activity_acked: true,
        }));

        let mut last_rejected = None;
        let should_continue = registry.tick(&snapshot, &mut last_rejected).await;
        assert!(!should_continue);

        let activity = store.list_activity(Some("task_completion_accepted"), 10).await.unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn check_once_reads_tester_session_for_testing_status() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StubGateway::new());
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));

        let mut task = Task::new("t".into(), None, Priority::Low);
        task.status = TaskStatus::Testing;
        task.assigned_agent_id = Some("agent-1".into());
        task.dispatch_id = Some("d1".into());
        task.dispatch_started_at = Some(Utc::now());
        task.openclaw_session_key = None;
        task.tester_session_key = Some("tester-session-1".into());
        let task = store.create_task(task).await.unwrap();

        let gateway_dyn: Arc<dyn GatewayAdapter> = gateway.clone();
        let registry = MonitorRegistry::new(store.clone(), gateway_dyn, state_machine, EventBus::new());
        registry.set_handoff(Arc::new(CountingHandoff { calls: AtomicUsize::new(0) }));

        gateway.push_assistant("TASK_COMPLETE dispatch_id=d1: reviewed, looks good").await;

        let accepted = registry.check_once(&task.id).await.unwrap();
        assert!(accepted, "check_once should read the tester_session_key for a Testing task, not openclaw_session_key");
    }
}
