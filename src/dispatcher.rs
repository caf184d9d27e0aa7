//! C6: sends a task to an agent, claiming a dispatch slot atomically and
//! starting a Monitor on success.
//!
//! Grounded in the teacher's `AtomicTaskStateManager::start_task_atomic`
//! (`agents/orchestrator/atomic_state.rs`), which re-validates the current
//! status inside the same critical section it writes to rather than trusting
//! a value read earlier — the "atomic slot claim" here (§4.6 step 7) is the
//! same idea applied to the `Store::transaction` primitive instead of a
//! locally-held `HashMap`.

use crate::constants;
use crate::events::{Event, EventBus, EventKind};
use crate::gateway::GatewayAdapter;
use crate::models::{AuthorType, Comment, Task, TaskPatch, TaskStatus};
use crate::monitor::{MonitorRegistry, StartMonitorParams};
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::store::{Store, TaskWrite};
use crate::error::{Result, SpiralError};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: String,
    pub agent_id: String,
    pub feedback: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeReason {
    ActiveMonitor,
    AlreadyInProgress,
    AwaitingFirstActivityAck,
}

impl DedupeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupeReason::ActiveMonitor => "active_monitor",
            DedupeReason::AlreadyInProgress => "already_in_progress",
            DedupeReason::AwaitingFirstActivityAck => "awaiting_first_activity_ack",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupeDecision {
    pub dedupe: bool,
    pub reason: Option<DedupeReason>,
}

/// Pure function (§8 property DED-1): same `(task, requested_agent_id,
/// monitor_active, now)` always yields the same decision.
pub fn dedupe_decision(
    task: &Task,
    requested_agent_id: &str,
    monitor_active: bool,
    now: DateTime<Utc>,
    ack_timeout_ms: u64,
) -> DedupeDecision {
    if task.assigned_agent_id.as_deref() != Some(requested_agent_id) {
        return DedupeDecision { dedupe: false, reason: None };
    }
    if monitor_active {
        return DedupeDecision {
            dedupe: true,
            reason: Some(DedupeReason::ActiveMonitor),
        };
    }
    if task.status == TaskStatus::InProgress {
        return DedupeDecision {
            dedupe: true,
            reason: Some(DedupeReason::AlreadyInProgress),
        };
    }
    if task.status == TaskStatus::Assigned {
        if let Some(started) = task.dispatch_started_at {
            let elapsed = now.signed_duration_since(started).num_milliseconds().max(0) as u64;
            if elapsed < ack_timeout_ms {
                return DedupeDecision {
                    dedupe: true,
                    reason: Some(DedupeReason::AwaitingFirstActivityAck),
                };
            }
        }
    }
    DedupeDecision { dedupe: false, reason: None }
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Dispatched(Task),
    Deduped { reason: DedupeReason, dispatch_id: Option<String> },
    ConcurrentRace { dispatch_id: Option<String> },
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    gateway: Arc<dyn GatewayAdapter>,
    state_machine: Arc<StateMachine>,
    monitors: Arc<MonitorRegistry>,
    events: EventBus,
    namespace: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn GatewayAdapter>,
        state_machine: Arc<StateMachine>,
        monitors: Arc<MonitorRegistry>,
        events: EventBus,
        namespace: String,
    ) -> Self {
        Self {
            store,
            gateway,
            state_machine,
            monitors,
            events,
            namespace,
        }
    }

    fn session_key_for(&self, agent_id: &str, task_id: &str) -> String {
        format!("{}:{}:dispatch:{}", self.namespace, agent_id, task_id)
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome> {
        let task = self
            .store
            .get_task(&req.task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {}", req.task_id)))?;
        let from_status = task.status;

        let session_key = task
            .openclaw_session_key
            .clone()
            .unwrap_or_else(|| self.session_key_for(&req.agent_id, &task.id));

        if let Some(feedback) = &req.feedback {
            self.store
                .add_comment(Comment::new(
                    task.id.clone(),
                    AuthorType::User,
                    Some(req.agent_id.clone()),
                    feedback.clone(),
                ))
                .await?;
            self.store
                .log_activity(crate::models::ActivityEntry::new(
                    "task_rework",
                    Some(task.id.clone()),
                    Some(req.agent_id.clone()),
                    "rework dispatched with feedback",
                    json!({ "feedback": feedback }),
                ))
                .await?;
        }

        let dispatch_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let monitor_active = self.monitors.is_active(&task.id, &req.agent_id).await;
        let decision = dedupe_decision(
            &task,
            &req.agent_id,
            monitor_active,
            now,
            constants::first_activity_ack_timeout_ms(),
        );
        if decision.dedupe {
            return Ok(DispatchOutcome::Deduped {
                reason: decision.reason.expect("dedupe implies a reason"),
                dispatch_id: task.dispatch_id.clone(),
            });
        }

        let claim_task_id = task.id.clone();
        let claim_agent_id = req.agent_id.clone();
        let claim_dispatch_id = dispatch_id.clone();
        let claim_session_key = session_key.clone();
        let claimed = self
            .store
            .transaction(
                &claim_task_id,
                Box::new(move |current: &Task| {
                    let race = current.dispatch_id.is_some()
                        && current.assigned_agent_id.as_deref() == Some(claim_agent_id.as_str())
                        && current.status.is_active();
                    if race {
                        return Err(SpiralError::Conflict("concurrent_dispatch_race".into()));
                    }
                    Ok(TaskWrite {
                        patch: TaskPatch {
                            dispatch_id: Some(Some(claim_dispatch_id.clone())),
                            dispatch_started_at: Some(Some(now)),
                            assigned_agent_id: Some(Some(claim_agent_id.clone())),
                            openclaw_session_key: Some(Some(claim_session_key.clone())),
                            ..Default::default()
                        },
                        new_status: None,
                        activity: None,
                    })
                }),
            )
            .await;

        let claimed = match claimed {
            Err(SpiralError::Conflict(_)) => {
                let latest = self.store.get_task(&task.id).await?;
                return Ok(DispatchOutcome::ConcurrentRace {
                    dispatch_id: latest.and_then(|t| t.dispatch_id),
                });
            }
            Err(e) => return Err(e),
            Ok(None) => return Err(SpiralError::NotFound(format!("task {}", task.id))),
            Ok(Some(t)) => t,
        };

        let baseline = self
            .gateway
            .get_chat_history(&session_key)
            .await
            .map(|history| history.iter().filter(|m| m.is_assistant()).count() as u32)
            .unwrap_or(0);

        let transition = self
            .state_machine
            .transition(
                &claimed.id,
                TaskStatus::Assigned,
                TransitionOptions::new("dispatcher", "agent dispatched").with_patch(TaskPatch {
                    dispatch_message_count_start: Some(baseline),
                    ..Default::default()
                }),
            )
            .await?;

        if !transition.ok {
            self.revert_claim(&claimed.id, from_status).await;
            return Err(SpiralError::Conflict(format!(
                "cannot dispatch: task {} may not move to assigned from its current state",
                claimed.id
            )));
        }
        let task_after_assign = transition.task.expect("ok transition carries the committed task");

        if req.model.is_some() || req.provider.is_some() {
            self.gateway
                .patch_session(
                    &session_key,
                    json!({ "model": req.model, "provider": req.provider }),
                )
                .await
                .ok();
        }

        let prompt = build_prompt(&task_after_assign, &dispatch_id, req.feedback.as_deref());

        if let Err(err) = self.gateway.send_message(&session_key, &prompt).await {
            self.revert_claim(&claimed.id, from_status).await;
            return Err(err);
        }

        self.monitors
            .start(StartMonitorParams {
                task_id: claimed.id.clone(),
                session_key: session_key.clone(),
                agent_id: req.agent_id.clone(),
                dispatch_id: dispatch_id.clone(),
                dispatch_started_at: now,
                baseline_assistant_count: baseline,
            })
            .await;

        self.events.publish(Event::new(
            EventKind::TaskUpdated,
            json!({ "taskId": claimed.id, "dispatchId": dispatch_id }),
        ));

        Ok(DispatchOutcome::Dispatched(task_after_assign))
    }

    /// Clears a dispatch claim that could not be turned into a sent message,
    /// leaving no trace that would cause a false dedupe on the next attempt
    /// (§4.6 step 11).
    async fn revert_claim(&self, task_id: &str, revert_to: TaskStatus) {
        let _ = self
            .state_machine
            .transition(
                task_id,
                revert_to,
                TransitionOptions::new("dispatcher", "reverting failed dispatch")
                    .bypassing_guards()
                    .with_patch(TaskPatch {
                        dispatch_id: Some(None),
                        dispatch_started_at: Some(None),
                        dispatch_message_count_start: Some(0),
                        ..Default::default()
                    }),
            )
            .await;
    }
}

fn build_prompt(task: &Task, dispatch_id: &str, feedback: Option<&str>) -> String {
    let mut prompt = format!("Task: {}\n", task.title);
    if let Some(description) = &task.description {
        prompt.push_str(&format!("{description}\n"));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\nRework requested:\n{feedback}\n"));
    }
    prompt.push_str(&format!(
        "\nWhen finished, reply with exactly: TASK_COMPLETE dispatch_id={dispatch_id}: <summary>"
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayEvent, Message};
    use crate::models::Priority;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct StubGateway {
        fail_send: bool,
    }

    #[async_trait]
    impl GatewayAdapter for StubGateway {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send_message(&self, _session_key: &str, _text: &str) -> Result<()> {
            if self.fail_send {
                Err(SpiralError::GatewayError("boom".into()))
            } else {
                Ok(())
            }
        }
        async fn patch_session(&self, _session_key: &str, _patch: serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn get_chat_history(&self, _session_key: &str) -> Result<Vec<Message>> {
            Ok(vec![])
        }
        fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
            broadcast::channel(1).1
        }
        async fn list_sessions(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_cron_jobs(&self) -> Result<Vec<serde_json::Value>> {
            Ok(vec![])
        }
        async fn cron_status(&self) -> Result<serde_json::Value> {
            Ok(json!({}))
        }
    }

    async fn dispatcher_with(fail_send: bool) -> (Dispatcher, Arc<dyn Store>, String) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let gateway: Arc<dyn GatewayAdapter> = Arc::new(StubGateway { fail_send });
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));
        let monitors = MonitorRegistry::new(store.clone(), gateway.clone(), state_machine.clone(), EventBus::new());
        monitors.set_handoff(Arc::new(NoopHandoff));

        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();

        let dispatcher = Dispatcher::new(
            store.clone(),
            gateway,
            state_machine,
            monitors,
            EventBus::new(),
            "mission-control".into(),
        );
        (dispatcher, store, id)
    }

    struct NoopHandoff;
    #[async_trait]
    impl crate::monitor::HandoffRouter for NoopHandoff {
        async fn handle_completion(&self, _task_id: &str, _was_tester_completion: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_dispatch_assigns_task_and_claims_slot() {
        let (dispatcher, store, id) = dispatcher_with(false).await;
        let outcome = dispatcher
            .dispatch(DispatchRequest {
                task_id: id.clone(),
                agent_id: "agent-1".into(),
                feedback: None,
                model: None,
                provider: None,
            })
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Dispatched(task) => {
                assert_eq!(task.status, TaskStatus::Assigned);
                assert!(task.dispatch_id.is_some());
            }
            other => panic!("expected Dispatched, got {other:?}"),
        }

        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.assigned_agent_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn failed_send_reverts_claim() {
        let (dispatcher, store, id) = dispatcher_with(true).await;
        let result = dispatcher
            .dispatch(DispatchRequest {
                task_id: id.clone(),
                agent_id: "agent-1".into(),
                feedback: None,
                model: None,
                provider: None,
            })
            .await;

        assert!(result.is_err());
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert!(task.dispatch_id.is_none());
        assert_eq!(task.status, TaskStatus::Inbox);
    }

    #[tokio::test]
    async fn dedupes_when_already_in_progress() {
        let (dispatcher, store, id) = dispatcher_with(false).await;
        let mut task = store.get_task(&id).await.unwrap().unwrap();
        task.status = TaskStatus::InProgress;
        task.assigned_agent_id = Some("agent-1".into());
        store.create_task(task).await.unwrap();

        // InMemoryStore::create_task always inserts keyed by id, so this replaces the record.
        let outcome = dispatcher
            .dispatch(DispatchRequest {
                task_id: id.clone(),
                agent_id: "agent-1".into(),
                feedback: None,
                model: None,
                provider: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Deduped {
                reason: DedupeReason::AlreadyInProgress,
                ..
            }
        ));
    }

    #[test]
    fn dedupe_decision_ignores_other_agents() {
        let mut task = Task::new("t".into(), None, Priority::Low);
        task.assigned_agent_id = Some("agent-1".into());
        task.status = TaskStatus::InProgress;
        let decision = dedupe_decision(&task, "agent-2", false, Utc::now(), 90_000);
        assert!(!decision.dedupe);
    }
}
