//! C8: single-turn JSON request/response protocol that delegates routing
//! decisions to a configured orchestrator agent, plus the three phase
//! routers that drive the Dispatcher with its decisions.
//!
//! Grounded in the same polling idiom the Monitor (C7) uses against the
//! Gateway Adapter, narrowed to a bounded number of attempts (§4.8 step 4-6)
//! rather than running indefinitely — the orchestrator call is always on the
//! hot path of a phase transition, so it must resolve to a decision and never
//! hang the caller.

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::Result;
use crate::gateway::GatewayAdapter;
use crate::json_extract::extract_json_object;
use crate::models::{AuthorType, Comment, DeliverableType, Task, TaskPatch, TaskStatus};
use crate::monitor::{HandoffRouter, MonitorRegistry, StartMonitorParams};
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::store::Store;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = crate::constants::ORCHESTRATOR_POLL_INTERVAL;
const TIMEOUT: Duration = crate::constants::ORCHESTRATOR_TIMEOUT;

#[derive(Debug, Clone)]
pub struct OrchestratorDecision {
    pub action: String,
    pub reasoning: String,
    pub feedback: Option<String>,
}

impl OrchestratorDecision {
    fn fallback(reasoning: impl Into<String>) -> Self {
        Self {
            action: "fallback".into(),
            reasoning: reasoning.into(),
            feedback: None,
        }
    }
}

pub struct OrchestratorRouter {
    store: Arc<dyn Store>,
    gateway: Arc<dyn GatewayAdapter>,
    state_machine: Arc<StateMachine>,
    dispatcher: Arc<Dispatcher>,
    monitors: Arc<MonitorRegistry>,
    namespace: String,
}

impl OrchestratorRouter {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn GatewayAdapter>,
        state_machine: Arc<StateMachine>,
        dispatcher: Arc<Dispatcher>,
        monitors: Arc<MonitorRegistry>,
        namespace: String,
    ) -> Self {
        Self {
            store,
            gateway,
            state_machine,
            dispatcher,
            monitors,
            namespace,
        }
    }

    fn session_key(&self, orchestrator_agent_id: &str, task_id: &str) -> String {
        format!("{}:{}:orchestrate:{}", self.namespace, orchestrator_agent_id, task_id)
    }

    /// §4.8's `invokeOrchestrator(taskId, prompt)` protocol.
    async fn invoke_orchestrator(&self, task_id: &str, orchestrator_agent_id: &str, prompt: &str) -> OrchestratorDecision {
        let session_key = self.session_key(orchestrator_agent_id, task_id);

        let _ = self
            .state_machine
            .transition(
                task_id,
                {
                    let Ok(Some(task)) = self.store.get_task(task_id).await else {
                        return OrchestratorDecision::fallback("task vanished before invocation");
                    };
                    task.status
                },
                TransitionOptions::new("orchestrator", "recording orchestrator session").with_patch(TaskPatch {
                    orchestrator_session_key: Some(Some(session_key.clone())),
                    ..Default::default()
                }),
            )
            .await;

        let baseline = self
            .gateway
            .get_chat_history(&session_key)
            .await
            .map(|h| h.iter().filter(|m| m.is_assistant()).count())
            .unwrap_or(0);

        if self.gateway.send_message(&session_key, prompt).await.is_err() {
            return OrchestratorDecision::fallback("failed to send prompt to orchestrator session");
        }

        let mut nudged = false;
        let deadline = tokio::time::Instant::now() + TIMEOUT;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let Ok(history) = self.gateway.get_chat_history(&session_key).await else {
                if tokio::time::Instant::now() >= deadline {
                    return OrchestratorDecision::fallback("timed out reading orchestrator session");
                }
                continue;
            };
            let assistants: Vec<_> = history.iter().filter(|m| m.is_assistant()).collect();
            if assistants.len() > baseline {
                let latest = assistants.last().expect("just checked non-empty growth");
                if let Some(decision) = parse_decision(&latest.text()) {
                    return decision;
                }
                if !nudged {
                    nudged = true;
                    let _ = self
                        .gateway
                        .send_message(
                            &session_key,
                            "Please reply with a single JSON object: {\"action\": ..., \"reasoning\": ...}",
                        )
                        .await;
                } else {
                    return OrchestratorDecision::fallback("orchestrator reply did not parse as JSON twice");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return OrchestratorDecision::fallback("orchestrator did not respond within the timeout");
            }
        }
    }

    async fn log_decision(&self, task_id: &str, phase: &str, decision: &OrchestratorDecision) {
        let _ = self
            .store
            .log_activity(crate::models::ActivityEntry::new(
                "orchestrator_decision",
                Some(task_id.to_string()),
                None,
                format!("{phase}: {}", decision.action),
                json!({ "action": decision.action, "reasoning": decision.reasoning, "phase": phase }),
            ))
            .await;
    }

    pub async fn after_planning(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let Some(orchestrator_agent_id) = self.store.get_workflow_settings().await?.orchestrator_agent_id else {
            return Ok(());
        };

        let prompt = format!(
            "Task \"{}\" finished planning. Spec:\n{}\n\nReply with JSON {{\"action\": \"dispatch_to_programmer\"|\"needs_more_planning\", \"reasoning\": ...}}",
            task.title,
            task.planning_spec.clone().unwrap_or_default(),
        );
        let decision = self.invoke_orchestrator(task_id, &orchestrator_agent_id, &prompt).await;
        self.log_decision(task_id, "after_planning", &decision).await;

        match decision.action.as_str() {
            "needs_more_planning" => {
                self.store
                    .add_comment(Comment::new(
                        task_id.to_string(),
                        AuthorType::System,
                        None,
                        format!("orchestrator requested more planning: {}", decision.reasoning),
                    ))
                    .await?;
            }
            _ => {
                if let Some(agent_id) = task.assigned_agent_id.clone() {
                    self.dispatcher
                        .dispatch(DispatchRequest {
                            task_id: task_id.to_string(),
                            agent_id,
                            feedback: None,
                            model: None,
                            provider: None,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn after_completion(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let settings = self.store.get_workflow_settings().await?;
        let Some(orchestrator_agent_id) = settings.orchestrator_agent_id.clone() else {
            return Ok(());
        };

        let prompt = format!(
            "Task \"{}\" was marked complete by its agent. Reply with JSON {{\"action\": \"send_to_testing\"|\"send_to_review\", \"reasoning\": ...}}",
            task.title
        );
        let decision = self.invoke_orchestrator(task_id, &orchestrator_agent_id, &prompt).await;
        self.log_decision(task_id, "after_completion", &decision).await;

        if decision.action == "send_to_testing" && settings.tester_agent_id.is_some() {
            self.dispatch_to_tester_agent(&task, settings.tester_agent_id.as_deref().unwrap()).await?;
        } else {
            self.state_machine
                .transition(
                    task_id,
                    TaskStatus::Review,
                    TransitionOptions::new("orchestrator", "after_completion: send_to_review").bypassing_guards(),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn after_testing(&self, task_id: &str) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let settings = self.store.get_workflow_settings().await?;
        let Some(orchestrator_agent_id) = settings.orchestrator_agent_id.clone() else {
            return Ok(());
        };

        let prompt = format!(
            "Task \"{}\" finished testing. Reply with JSON {{\"action\": \"send_to_review\"|\"send_to_programmer\", \"feedback\": ..., \"reasoning\": ...}}",
            task.title
        );
        let decision = self.invoke_orchestrator(task_id, &orchestrator_agent_id, &prompt).await;
        self.log_decision(task_id, "after_testing", &decision).await;

        if decision.action == "send_to_programmer" {
            if task.rework_count >= settings.max_rework_cycles {
                self.store
                    .add_comment(Comment::new(
                        task_id.to_string(),
                        AuthorType::System,
                        None,
                        format!(
                            "rework cycle limit ({}) reached, escalating to review",
                            settings.max_rework_cycles
                        ),
                    ))
                    .await?;
                self.state_machine
                    .transition(
                        task_id,
                        TaskStatus::Review,
                        TransitionOptions::new("orchestrator", "rework_limit_escalation").bypassing_guards(),
                    )
                    .await?;
                return Ok(());
            }

            self.store
                .add_comment(Comment::new(
                    task_id.to_string(),
                    AuthorType::System,
                    None,
                    decision.feedback.clone().unwrap_or_else(|| decision.reasoning.clone()),
                ))
                .await?;
            self.state_machine
                .transition(
                    task_id,
                    task.status,
                    TransitionOptions::new("orchestrator", "rework cycle incremented").with_patch(TaskPatch {
                        rework_count: Some(task.rework_count + 1),
                        ..Default::default()
                    }),
                )
                .await?;

            if let Some(agent_id) = task.assigned_agent_id.clone() {
                self.dispatcher
                    .dispatch(DispatchRequest {
                        task_id: task_id.to_string(),
                        agent_id,
                        feedback: decision.feedback.clone(),
                        model: None,
                        provider: None,
                    })
                    .await?;
            }
        } else {
            self.state_machine
                .transition(
                    task_id,
                    TaskStatus::Review,
                    TransitionOptions::new("orchestrator", "after_testing: send_to_review").bypassing_guards(),
                )
                .await?;
        }
        Ok(())
    }

    /// §4.8's `dispatchToTesterAgent`: a fresh dispatch claim under the
    /// tester agent's session, keeping `assigned_agent_id` pointed at the
    /// programmer for attribution.
    async fn dispatch_to_tester_agent(&self, task: &Task, tester_agent_id: &str) -> Result<()> {
        let session_key = format!("{}:{}:tester:{}", self.namespace, tester_agent_id, task.id);
        let dispatch_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now();

        let baseline = self
            .gateway
            .get_chat_history(&session_key)
            .await
            .map(|h| h.iter().filter(|m| m.is_assistant()).count() as u32)
            .unwrap_or(0);

        self.state_machine
            .transition(
                &task.id,
                TaskStatus::Testing,
                TransitionOptions::new("orchestrator", "dispatch to tester agent").with_patch(TaskPatch {
                    tester_session_key: Some(Some(session_key.clone())),
                    dispatch_id: Some(Some(dispatch_id.clone())),
                    dispatch_started_at: Some(Some(now)),
                    dispatch_message_count_start: Some(baseline),
                    ..Default::default()
                }),
            )
            .await?;

        let prompt = format!(
            "Test task \"{}\". When finished, reply with exactly: TASK_COMPLETE dispatch_id={}: <summary>",
            task.title, dispatch_id
        );
        self.gateway.send_message(&session_key, &prompt).await?;

        self.monitors
            .start(StartMonitorParams {
                task_id: task.id.clone(),
                session_key,
                agent_id: task.assigned_agent_id.clone().unwrap_or_default(),
                dispatch_id,
                dispatch_started_at: now,
                baseline_assistant_count: baseline,
            })
            .await;

        Ok(())
    }
}

/// Post-acceptance routing policy (§4.7's "Handoff after acceptance"): the
/// concrete `HandoffRouter` the Monitor calls into. Lives beside the
/// orchestrator because the "no orchestrator configured" fallback path
/// (transition to testing/review directly) needs the same Store/StateMachine
/// wiring, not because it is conceptually part of the orchestrator protocol.
pub struct Handoff {
    store: Arc<dyn Store>,
    state_machine: Arc<StateMachine>,
    orchestrator: Arc<OrchestratorRouter>,
    test_trigger: Arc<dyn TestTrigger>,
}

#[async_trait]
pub trait TestTrigger: Send + Sync {
    async fn trigger(&self, task_id: &str);
}

/// Default trigger: none configured means the pipeline is simply not called;
/// the task still moves to `testing` so a human or external watcher can act.
pub struct NoopTestTrigger;

#[async_trait]
impl TestTrigger for NoopTestTrigger {
    async fn trigger(&self, _task_id: &str) {}
}

impl Handoff {
    pub fn new(
        store: Arc<dyn Store>,
        state_machine: Arc<StateMachine>,
        orchestrator: Arc<OrchestratorRouter>,
        test_trigger: Arc<dyn TestTrigger>,
    ) -> Self {
        Self {
            store,
            state_machine,
            orchestrator,
            test_trigger,
        }
    }
}

#[async_trait]
impl HandoffRouter for Handoff {
    async fn handle_completion(&self, task_id: &str, was_tester_completion: bool) -> Result<()> {
        let settings = self.store.get_workflow_settings().await?;

        if settings.orchestrator_agent_id.is_some() {
            let result = if was_tester_completion {
                self.orchestrator.after_testing(task_id).await
            } else {
                self.orchestrator.after_completion(task_id).await
            };
            if result.is_err() {
                self.state_machine
                    .transition(
                        task_id,
                        TaskStatus::Review,
                        TransitionOptions::new("handoff", "orchestrator call failed, falling back to review")
                            .bypassing_guards(),
                    )
                    .await?;
            }
            return Ok(());
        }

        let deliverables = self.store.list_deliverables(task_id).await?;
        let has_testable_deliverable = deliverables
            .iter()
            .any(|d| matches!(d.deliverable_type, DeliverableType::File | DeliverableType::Url));

        if has_testable_deliverable && !was_tester_completion {
            self.state_machine
                .transition(
                    task_id,
                    TaskStatus::Testing,
                    TransitionOptions::new("handoff", "deliverable present, routing to testing"),
                )
                .await?;
            self.test_trigger.trigger(task_id).await;
        } else {
            self.state_machine
                .transition(task_id, TaskStatus::Review, TransitionOptions::new("handoff", "no orchestrator, no deliverable to test"))
                .await?;
        }
        Ok(())
    }
}

fn parse_decision(text: &str) -> Option<OrchestratorDecision> {
    let value = extract_json_object(text)?;
    let action = value.get("action")?.as_str()?.to_string();
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let feedback = value.get("feedback").and_then(|v| v.as_str()).map(str::to_string);
    Some(OrchestratorDecision {
        action,
        reasoning,
        feedback,
    })
}

#[cfg(test)]
pub struct NoopHandoffForTests;

#[cfg(test)]
#[async_trait]
impl HandoffRouter for NoopHandoffForTests {
    async fn handle_completion(&self, _task_id: &str, _was_tester_completion: bool) -> Result<()> {
        Ok(())
    }
}
