//! C10: question/answer planning loop that produces a spec before dispatch.
//!
//! Grounded in the same "opaque prompt, poll the session, react to structured
//! JSON from the agent" shape as the Orchestrator Router (§4.8); the Planning
//! Controller is the same idea with a simpler two-field contract
//! (`question` vs `complete`+`spec`) instead of an `action` enum.

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::{Result, SpiralError};
use crate::gateway::GatewayAdapter;
use crate::json_extract::extract_json_object;
use crate::models::{Task, TaskPatch, TaskStatus};
use crate::orchestrator::OrchestratorRouter;
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::store::Store;
use serde_json::json;
use std::sync::Arc;

pub struct PlanningController {
    store: Arc<dyn Store>,
    gateway: Arc<dyn GatewayAdapter>,
    state_machine: Arc<StateMachine>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<OrchestratorRouter>,
    namespace: String,
}

impl PlanningController {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn GatewayAdapter>,
        state_machine: Arc<StateMachine>,
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<OrchestratorRouter>,
        namespace: String,
    ) -> Self {
        Self {
            store,
            gateway,
            state_machine,
            dispatcher,
            orchestrator,
            namespace,
        }
    }

    pub async fn start(&self, task_id: &str) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;

        if task.planning_session_key.is_some() {
            return Err(SpiralError::Conflict("planning already started".into()));
        }

        let session_key = format!("{}:planner:{}", self.namespace, task_id);
        let seed = format!(
            "Plan the following task and ask any clarifying questions before producing a spec.\n\nTitle: {}\n{}",
            task.title,
            task.description.clone().unwrap_or_default()
        );
        self.gateway.send_message(&session_key, &seed).await?;

        let result = self
            .state_machine
            .transition(
                task_id,
                TaskStatus::Planning,
                TransitionOptions::new("planning", "planning started").with_patch(TaskPatch {
                    planning_session_key: Some(Some(session_key)),
                    planning_messages: Some(Some(seed)),
                    ..Default::default()
                }),
            )
            .await?;

        result.task.ok_or_else(|| SpiralError::Internal(anyhow::anyhow!("transition produced no task")))
    }

    pub async fn poll(&self, task_id: &str) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;

        let Some(session_key) = task.planning_session_key.clone() else {
            return Ok(task);
        };

        let history = self.gateway.get_chat_history(&session_key).await?;
        let Some(latest) = history.iter().filter(|m| m.is_assistant()).last() else {
            return Ok(task);
        };
        let text = latest.text();
        let Some(value) = extract_json_object(&text) else {
            return Ok(task);
        };

        if value.get("complete").and_then(|v| v.as_bool()) == Some(true) {
            if let Some(spec) = value.get("spec") {
                // `spec` may be a JSON string or a JSON object (spec.md §4.10's
                // worked example replies with an object) — either way it is
                // stored as the opaque `planning_spec` string.
                let spec_json = match spec.as_str() {
                    Some(s) => s.to_string(),
                    None => serde_json::to_string(spec).unwrap_or_default(),
                };
                let result = self
                    .state_machine
                    .transition(
                        task_id,
                        TaskStatus::Planning,
                        TransitionOptions::new("planning", "planning complete").with_patch(TaskPatch {
                            planning_complete: Some(true),
                            planning_spec: Some(Some(spec_json)),
                            planning_question_waiting: Some(false),
                            ..Default::default()
                        }),
                    )
                    .await?;
                let task = result.task.expect("same-status patch always returns the task");
                self.maybe_auto_dispatch(&task).await;
                return Ok(task);
            }
        }

        if value.get("question").and_then(|v| v.as_str()).is_some() {
            let result = self
                .state_machine
                .transition(
                    task_id,
                    TaskStatus::Planning,
                    TransitionOptions::new("planning", "planner asked a question").with_patch(TaskPatch {
                        planning_question_waiting: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            return Ok(result.task.expect("same-status patch always returns the task"));
        }

        Ok(task)
    }

    pub async fn answer(&self, task_id: &str, answer: &str, other_text: Option<&str>) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;
        let Some(session_key) = task.planning_session_key.clone() else {
            return Err(SpiralError::InvalidRequest("planning has not started".into()));
        };

        let mut reply = answer.to_string();
        if let Some(extra) = other_text {
            reply.push_str("\n\n");
            reply.push_str(extra);
        }
        self.gateway.send_message(&session_key, &reply).await?;

        let result = self
            .state_machine
            .transition(
                task_id,
                TaskStatus::Planning,
                TransitionOptions::new("planning", "answered planner question").with_patch(TaskPatch {
                    planning_question_waiting: Some(false),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(result.task.expect("same-status patch always returns the task"))
    }

    pub async fn approve(&self, task_id: &str) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))?;

        if !task.planning_complete {
            return Err(SpiralError::InvalidRequest("planning spec is not complete yet".into()));
        }
        if task.assigned_agent_id.is_none() {
            return Err(SpiralError::InvalidRequest("task has no assigned agent".into()));
        }

        self.maybe_auto_dispatch(&task).await;
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let result = self
            .state_machine
            .transition(
                task_id,
                TaskStatus::Inbox,
                TransitionOptions::new("planning", "planning cancelled")
                    .bypassing_guards()
                    .with_patch(TaskPatch {
                        planning_session_key: Some(None),
                        planning_messages: Some(None),
                        planning_complete: Some(false),
                        planning_spec: Some(None),
                        planning_dispatch_error: Some(None),
                        planning_question_waiting: Some(false),
                        ..Default::default()
                    }),
            )
            .await?;
        result.task.ok_or_else(|| SpiralError::NotFound(format!("task {task_id}")))
    }

    /// Shared by `poll` (reaching `complete`) and `approve`: either hands off
    /// to the orchestrator or dispatches directly, or — if no agent is
    /// assigned — parks the task back in `inbox` (§4.10).
    async fn maybe_auto_dispatch(&self, task: &Task) {
        let Some(agent_id) = task.assigned_agent_id.clone() else {
            let _ = self
                .state_machine
                .transition(
                    &task.id,
                    TaskStatus::Inbox,
                    TransitionOptions::new("planning", "planning_complete_awaiting_dispatch").bypassing_guards(),
                )
                .await;
            return;
        };

        let settings = match self.store.get_workflow_settings().await {
            Ok(s) => s,
            Err(_) => return,
        };

        if settings.orchestrator_agent_id.is_some() {
            let orchestrator = self.orchestrator.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let _ = orchestrator.after_planning(&task_id).await;
            });
        } else {
            let dispatcher = self.dispatcher.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let _ = dispatcher
                    .dispatch(DispatchRequest {
                        task_id,
                        agent_id,
                        feedback: None,
                        model: None,
                        provider: None,
                    })
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::gateway::{GatewayEvent, Message, MessageContent};
    use crate::models::Priority;
    use crate::monitor::MonitorRegistry;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use tokio::sync::{broadcast, Mutex};

    struct StubGateway {
        reply: Mutex<Option<String>>,
    }

    #[async_trait]
    impl GatewayAdapter for StubGateway {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send_message(&self, _session_key: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn patch_session(&self, _session_key: &str, _patch: serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn get_chat_history(&self, _session_key: &str) -> Result<Vec<Message>> {
            let reply = self.reply.lock().await.clone();
            Ok(reply
                .into_iter()
                .map(|text| Message {
                    role: "assistant".into(),
                    content: MessageContent::Text(text),
                    timestamp: Some(chrono::Utc::now()),
                })
                .collect())
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

    fn wire(reply: Option<&str>) -> (PlanningController, Arc<dyn Store>, Arc<StubGateway>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StubGateway {
            reply: Mutex::new(reply.map(str::to_string)),
        });
        let gateway_dyn: Arc<dyn GatewayAdapter> = gateway.clone();
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));
        let monitors = MonitorRegistry::new(store.clone(), gateway_dyn.clone(), state_machine.clone(), EventBus::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            gateway_dyn.clone(),
            state_machine.clone(),
            monitors.clone(),
            EventBus::new(),
            "mission-control".into(),
        ));
        let orchestrator = Arc::new(OrchestratorRouter::new(
            store.clone(),
            gateway_dyn.clone(),
            state_machine.clone(),
            dispatcher.clone(),
            monitors.clone(),
            "mission-control".into(),
        ));
        monitors.set_handoff(Arc::new(crate::orchestrator::NoopHandoffForTests));
        let controller = PlanningController::new(
            store.clone(),
            gateway_dyn,
            state_machine,
            dispatcher,
            orchestrator,
            "mission-control".into(),
        );
        (controller, store, gateway)
    }

    #[tokio::test]
    async fn start_moves_task_into_planning() {
        let (controller, store, _gateway) = wire(None);
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();

        let task = controller.start(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Planning);
        assert!(task.planning_session_key.is_some());
    }

    #[tokio::test]
    async fn start_twice_conflicts() {
        let (controller, store, _gateway) = wire(None);
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        controller.start(&id).await.unwrap();

        let result = controller.start(&id).await;
        assert!(matches!(result, Err(SpiralError::Conflict(_))));
    }

    #[tokio::test]
    async fn poll_marks_question_waiting() {
        let (controller, store, _gateway) = wire(Some(r#"{"question": "which repo?"}"#));
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        controller.start(&id).await.unwrap();

        let task = controller.poll(&id).await.unwrap();
        assert!(task.planning_question_waiting);
    }

    #[tokio::test]
    async fn poll_completes_and_stores_spec() {
        let (controller, store, _gateway) = wire(Some(r#"{"complete": true, "spec": "do the thing"}"#));
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        controller.start(&id).await.unwrap();

        let task = controller.poll(&id).await.unwrap();
        assert!(task.planning_complete);
        assert_eq!(task.planning_spec.as_deref(), Some("do the thing"));
    }

    #[tokio::test]
    async fn poll_completes_and_stores_object_shaped_spec() {
        let (controller, store, _gateway) =
            wire(Some(r#"{"complete": true, "spec": {"summary": "do the thing", "steps": [1, 2]}}"#));
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        controller.start(&id).await.unwrap();

        let task = controller.poll(&id).await.unwrap();
        assert!(task.planning_complete);
        let stored = task.planning_spec.expect("spec stored");
        let parsed: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(parsed["summary"], "do the thing");
        assert_eq!(parsed["steps"][1], 2);
    }

    #[tokio::test]
    async fn cancel_clears_planning_fields() {
        let (controller, store, _gateway) = wire(None);
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        controller.start(&id).await.unwrap();

        let task = controller.cancel(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Inbox);
        assert!(task.planning_session_key.is_none());
    }
}
