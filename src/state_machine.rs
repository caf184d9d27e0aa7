//! C4: guarded status transitions with atomic patch + activity log.
//!
//! Grounded in the teacher's `AtomicTaskStateManager` (`agents/orchestrator/atomic_state.rs`):
//! that type serializes task status changes by acquiring the store's locks in
//! one place and refusing invalid transitions (`Pending -> InProgress` twice,
//! `Completed -> InProgress`, ...). Here the guard table comes from the data
//! model's state graph (§4.4) instead of the teacher's four-state enum, and
//! every write is additionally paired with an `ActivityEntry` in the same
//! store transaction — no other component may set `status` directly.

use crate::events::{Event, EventBus, EventKind};
use crate::models::{ActivityEntry, Task, TaskPatch, TaskStatus};
use crate::store::{Store, TaskWrite};
use serde_json::json;
use std::sync::Arc;

/// Why a transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    TaskNotFound,
    InvalidTransition,
}

#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub ok: bool,
    pub noop: bool,
    pub blocked: Option<Blocked>,
    pub task: Option<Task>,
}

impl TransitionResult {
    fn not_found() -> Self {
        Self {
            ok: false,
            noop: false,
            blocked: Some(Blocked::TaskNotFound),
            task: None,
        }
    }

    fn blocked_invalid(task: Task) -> Self {
        Self {
            ok: false,
            noop: false,
            blocked: Some(Blocked::InvalidTransition),
            task: Some(task),
        }
    }

    fn ok(task: Task, noop: bool) -> Self {
        Self {
            ok: true,
            noop,
            blocked: None,
            task: Some(task),
        }
    }
}

/// Options for a `transition` call. Mirrors the `opts` bag in §4.4.
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    pub actor: String,
    pub reason: String,
    pub agent_id: Option<String>,
    pub patch: TaskPatch,
    pub metadata: serde_json::Value,
    pub bypass_guards: bool,
}

impl TransitionOptions {
    pub fn new(actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            reason: reason.into(),
            agent_id: None,
            patch: TaskPatch::default(),
            metadata: json!({}),
            bypass_guards: false,
        }
    }

    pub fn with_patch(mut self, patch: TaskPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn bypassing_guards(mut self) -> Self {
        self.bypass_guards = true;
        self
    }
}

/// The only component permitted to change `Task::status`. Every other
/// component (Dispatcher, Monitor, Orchestrator, Reconciler, Planning
/// Controller, the API façade) routes status changes through this function.
pub struct StateMachine {
    store: Arc<dyn Store>,
    events: EventBus,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        opts: TransitionOptions,
    ) -> crate::Result<TransitionResult> {
        let Some(current) = self.store.get_task(task_id).await? else {
            return Ok(TransitionResult::not_found());
        };

        let from = current.status;
        let patch_empty = opts.patch.is_empty();

        if from == to && patch_empty {
            return Ok(TransitionResult::ok(current, true));
        }

        if from == to {
            // Reaffirmed: same status, but the caller wants the patch applied.
            let activity = ActivityEntry::new(
                "task_status_reaffirmed",
                Some(task_id.to_string()),
                opts.agent_id.clone(),
                format!("{} reaffirmed status {:?}: {}", opts.actor, to, opts.reason),
                merge_metadata(&opts, from, to),
            );
            let write = TaskWrite {
                patch: opts.patch.clone(),
                new_status: None,
                activity: Some(activity),
            };
            let committed = self
                .store
                .transaction(task_id, Box::new(move |_| Ok(write)))
                .await?
                .expect("task existed under the same read");
            self.events.publish(Event::new(
                EventKind::TaskUpdated,
                json!({ "taskId": task_id, "status": to }),
            ));
            return Ok(TransitionResult::ok(committed, false));
        }

        if !from.can_transition_to(to) && !opts.bypass_guards {
            let activity = ActivityEntry::new(
                "task_transition_blocked",
                Some(task_id.to_string()),
                opts.agent_id.clone(),
                format!("blocked {:?} -> {:?}: {}", from, to, opts.reason),
                merge_metadata(&opts, from, to),
            );
            self.store.log_activity(activity).await?;
            return Ok(TransitionResult::blocked_invalid(current));
        }

        let guarded = !from.can_transition_to(to);
        let mut metadata = merge_metadata(&opts, from, to);
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("guarded".into(), json!(guarded));
        }
        let activity = ActivityEntry::new(
            "task_status_changed",
            Some(task_id.to_string()),
            opts.agent_id.clone(),
            format!("{} moved {:?} -> {:?}: {}", opts.actor, from, to, opts.reason),
            metadata,
        );
        let write = TaskWrite {
            patch: opts.patch.clone(),
            new_status: Some(to),
            activity: Some(activity),
        };
        let committed = self
            .store
            .transaction(task_id, Box::new(move |_| Ok(write)))
            .await?
            .expect("task existed under the same read");

        self.events.publish(Event::new(
            EventKind::TaskUpdated,
            json!({ "taskId": task_id, "status": to, "from": from }),
        ));

        Ok(TransitionResult::ok(committed, false))
    }
}

fn merge_metadata(opts: &TransitionOptions, from: TaskStatus, to: TaskStatus) -> serde_json::Value {
    let mut value = opts.metadata.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("from".into(), json!(from));
        obj.insert("to".into(), json!(to));
        obj.insert("actor".into(), json!(opts.actor));
        obj.insert("reason".into(), json!(opts.reason));
    } else {
        value = json!({
            "from": from,
            "to": to,
            "actor": opts.actor,
            "reason": opts.reason,
        });
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, Task};
    use crate::store::InMemoryStore;

    async fn new_machine() -> (StateMachine, Arc<dyn Store>, String) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        let machine = StateMachine::new(store.clone(), EventBus::new());
        (machine, store, id)
    }

    #[tokio::test]
    async fn allowed_transition_commits_status_and_activity() {
        let (machine, store, id) = new_machine().await;
        let result = machine
            .transition(&id, TaskStatus::Planning, TransitionOptions::new("user", "start planning"))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.task.unwrap().status, TaskStatus::Planning);

        let activity = store.list_activity(Some("task_status_changed"), 10).await.unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn disallowed_transition_is_blocked_without_bypass() {
        let (machine, store, id) = new_machine().await;
        let result = machine
            .transition(&id, TaskStatus::InProgress, TransitionOptions::new("user", "skip ahead"))
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.blocked, Some(Blocked::InvalidTransition));

        let activity = store.list_activity(Some("task_transition_blocked"), 10).await.unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn bypass_guards_allows_disallowed_transition() {
        let (machine, _store, id) = new_machine().await;
        let result = machine
            .transition(
                &id,
                TaskStatus::InProgress,
                TransitionOptions::new("system", "force").bypassing_guards(),
            )
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.task.unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn same_status_noop_without_patch() {
        let (machine, store, id) = new_machine().await;
        let result = machine
            .transition(&id, TaskStatus::Inbox, TransitionOptions::new("user", "noop"))
            .await
            .unwrap();
        assert!(result.ok);
        assert!(result.noop);
        assert!(store.list_activity(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_status_with_patch_reaffirms() {
        let (machine, store, id) = new_machine().await;
        let patch = TaskPatch {
            rework_count: Some(2),
            ..Default::default()
        };
        let result = machine
            .transition(
                &id,
                TaskStatus::Inbox,
                TransitionOptions::new("user", "reaffirm").with_patch(patch),
            )
            .await
            .unwrap();
        assert!(result.ok);
        assert!(!result.noop);
        assert_eq!(result.task.unwrap().rework_count, 2);

        let activity = store.list_activity(Some("task_status_reaffirmed"), 10).await.unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn transition_on_missing_task_reports_not_found() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let machine = StateMachine::new(store, EventBus::new());
        let result = machine
            .transition("missing", TaskStatus::Planning, TransitionOptions::new("user", "x"))
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.blocked, Some(Blocked::TaskNotFound));
    }
}
