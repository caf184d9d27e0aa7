//! C9: deterministic, idempotent periodic pass that reconciles a task's
//! status to observed runtime evidence.
//!
//! Grounded in the teacher's `status_manager.rs` "separated service" shape —
//! a small component whose only job is comparing recorded state against
//! what's actually true and correcting drift, kept independent of the
//! Dispatcher/Monitor so it can be invoked on its own schedule or on demand
//! (the HTTP surface's `POST /tasks/reconcile` and `GET /tasks/check-completion`
//! both call it directly).

use crate::models::{Task, TaskStatus};
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::store::{Store, TaskFilter};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

#[async_trait]
pub trait SessionEvidence: Send + Sync {
    /// Count of assistant messages and the newest assistant message's
    /// timestamp (if any) for the task's session. Errors are swallowed by
    /// the caller — a read failure leaves the task's status untouched.
    async fn evidence(&self, session_key: &str) -> crate::Result<(u32, Option<chrono::DateTime<chrono::Utc>>)>;
}

/// Adapts any `GatewayAdapter` into `SessionEvidence` without the reconciler
/// needing to know about `Message`/`MessageContent`.
pub struct GatewaySessionEvidence {
    gateway: Arc<dyn crate::gateway::GatewayAdapter>,
}

impl GatewaySessionEvidence {
    pub fn new(gateway: Arc<dyn crate::gateway::GatewayAdapter>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SessionEvidence for GatewaySessionEvidence {
    async fn evidence(&self, session_key: &str) -> crate::Result<(u32, Option<chrono::DateTime<chrono::Utc>>)> {
        let history = self.gateway.get_chat_history(session_key).await?;
        let assistants: Vec<_> = history.iter().filter(|m| m.is_assistant()).collect();
        let count = assistants.len() as u32;
        let newest = assistants.iter().filter_map(|m| m.timestamp).max();
        Ok((count, newest))
    }
}

pub struct ReconcileReport {
    pub checked: usize,
    pub reconciled: Vec<String>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    state_machine: Arc<StateMachine>,
    evidence: Arc<dyn SessionEvidence>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, state_machine: Arc<StateMachine>, evidence: Arc<dyn SessionEvidence>) -> Self {
        Self {
            store,
            state_machine,
            evidence,
        }
    }

    pub async fn reconcile(&self) -> crate::Result<ReconcileReport> {
        let assigned = self.store.list_tasks(TaskFilter { status: Some(TaskStatus::Assigned), agent: None }).await?;
        let in_progress = self.store.list_tasks(TaskFilter { status: Some(TaskStatus::InProgress), agent: None }).await?;

        let mut checked = 0;
        let mut reconciled = Vec::new();

        for task in assigned.into_iter().chain(in_progress.into_iter()) {
            checked += 1;
            if let Some(id) = self.reconcile_task(&task).await? {
                reconciled.push(id);
            }
        }

        Ok(ReconcileReport { checked, reconciled })
    }

    async fn reconcile_task(&self, task: &Task) -> crate::Result<Option<String>> {
        let Some(session_key) = &task.openclaw_session_key else {
            return Ok(None);
        };

        let Ok((assistant_count, newest_timestamp)) = self.evidence.evidence(session_key).await else {
            return Ok(None);
        };

        let has_new_evidence = assistant_count > task.dispatch_message_count_start;
        let timestamp_fresh = match (task.dispatch_started_at, newest_timestamp) {
            (Some(started), Some(newest)) => newest >= started,
            _ => true,
        };

        let expected = if has_new_evidence && timestamp_fresh {
            TaskStatus::InProgress
        } else {
            TaskStatus::Assigned
        };

        if expected == task.status {
            return Ok(None);
        }

        let result = self
            .state_machine
            .transition(
                &task.id,
                expected,
                TransitionOptions::new("reconciler", "status drift from observed runtime evidence").with_metadata(json!({
                    "assistantCount": assistant_count,
                    "dispatchMessageCountStart": task.dispatch_message_count_start,
                })),
            )
            .await?;

        if !result.ok {
            return Ok(None);
        }

        self.store
            .log_activity(crate::models::ActivityEntry::new(
                "task_reconciled",
                Some(task.id.clone()),
                task.assigned_agent_id.clone(),
                format!("reconciled {:?} -> {:?}", task.status, expected),
                json!({ "from": task.status, "to": expected }),
            ))
            .await?;

        Ok(Some(task.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::{Priority, Task};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    struct FixedEvidence {
        count: u32,
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[async_trait]
    impl SessionEvidence for FixedEvidence {
        async fn evidence(&self, _session_key: &str) -> crate::Result<(u32, Option<chrono::DateTime<chrono::Utc>>)> {
            Ok((self.count, self.timestamp))
        }
    }

    #[tokio::test]
    async fn promotes_assigned_to_in_progress_on_new_evidence() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));
        let now = Utc::now();

        let mut task = Task::new("t".into(), None, Priority::Low);
        task.status = TaskStatus::Assigned;
        task.openclaw_session_key = Some("s1".into());
        task.dispatch_started_at = Some(now - chrono::Duration::seconds(30));
        task.dispatch_message_count_start = 1;
        let task = store.create_task(task).await.unwrap();

        let evidence: Arc<dyn SessionEvidence> = Arc::new(FixedEvidence { count: 3, timestamp: Some(now) });
        let reconciler = Reconciler::new(store.clone(), state_machine, evidence);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.reconciled, vec![task.id.clone()]);

        let updated = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);

        let activity = store.list_activity(Some("task_reconciled"), 10).await.unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn leaves_status_untouched_when_already_correct() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));

        let mut task = Task::new("t".into(), None, Priority::Low);
        task.status = TaskStatus::Assigned;
        task.openclaw_session_key = Some("s1".into());
        task.dispatch_message_count_start = 0;
        let task = store.create_task(task).await.unwrap();

        let evidence: Arc<dyn SessionEvidence> = Arc::new(FixedEvidence { count: 0, timestamp: None });
        let reconciler = Reconciler::new(store.clone(), state_machine, evidence);

        let report = reconciler.reconcile().await.unwrap();
        assert!(report.reconciled.is_empty());
        assert!(store.list_activity(None, 10).await.unwrap().is_empty());
        let _ = task;
    }

    #[tokio::test]
    async fn skips_tasks_without_a_session_key() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let state_machine = Arc::new(StateMachine::new(store.clone(), EventBus::new()));

        let mut task = Task::new("t".into(), None, Priority::Low);
        task.status = TaskStatus::Assigned;
        store.create_task(task).await.unwrap();

        let evidence: Arc<dyn SessionEvidence> = Arc::new(FixedEvidence { count: 5, timestamp: None });
        let reconciler = Reconciler::new(store.clone(), state_machine, evidence);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.reconciled.is_empty());
    }
}
