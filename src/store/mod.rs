//! C1: transactional task/activity/comment/deliverable/session records.
//!
//! Grounded in the teacher's `SessionStore`/`InMemorySessionStore` trait+impl
//! split and `ResultStore`/`TaskRepository`'s concrete-store-plus-repository-trait
//! shape: a narrow async trait describes the contract a persistent backend
//! would have to satisfy; `InMemoryStore` is the only implementation needed
//! here, guarded by a single `tokio::sync::Mutex` the way `ResultStore` guards
//! its maps with `Arc<Mutex<HashMap<...>>>`.

use crate::error::{Result, SpiralError};
use crate::models::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if task.assigned_agent_id.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The result of a closure run inside `Store::transaction`: the patch and
/// (optionally) status to commit, plus the activity entry that must land in
/// the same write (C4's "status change always pairs with an activity entry"
/// rule is enforced by the state machine always supplying one here).
#[derive(Debug, Clone, Default)]
pub struct TaskWrite {
    pub patch: TaskPatch,
    pub new_status: Option<TaskStatus>,
    pub activity: Option<ActivityEntry>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<Task>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>>;
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Runs `f` against the latest committed Task for `task_id` and applies
    /// the returned `TaskWrite` (patch + status + activity) atomically. A
    /// `task_not_found` result is signalled by returning `Ok(None)` from the
    /// whole call without invoking `f`.
    async fn transaction(
        &self,
        task_id: &str,
        f: Box<dyn FnOnce(&Task) -> Result<TaskWrite> + Send>,
    ) -> Result<Option<Task>>;

    async fn add_comment(&self, comment: Comment) -> Result<Comment>;
    async fn list_comments(&self, task_id: &str) -> Result<Vec<Comment>>;

    async fn add_deliverable(&self, deliverable: Deliverable) -> Result<Deliverable>;
    async fn list_deliverables(&self, task_id: &str) -> Result<Vec<Deliverable>>;
    async fn delete_deliverable(&self, task_id: &str, deliverable_id: &str) -> Result<()>;

    async fn log_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry>;
    async fn list_activity(&self, entry_type: Option<&str>, limit: usize) -> Result<Vec<ActivityEntry>>;

    async fn get_workflow_settings(&self) -> Result<WorkflowSettings>;
    async fn set_workflow_settings(&self, settings: WorkflowSettings) -> Result<()>;

    async fn upsert_session(&self, session: Session) -> Result<Session>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    comments: HashMap<String, Vec<Comment>>,
    deliverables: HashMap<String, Vec<Deliverable>>,
    activity: Vec<ActivityEntry>,
    sessions: HashMap<String, Session>,
    workflow_settings: WorkflowSettings,
    sort_order_seq: i64,
}

/// In-process store standing in for the persisted relational file described
/// in §6 (tables `tasks`, `task_comments`, `activity_log`, `deliverables`,
/// `sessions`, `workflow_settings`). Single-writer serializability is
/// provided by one `tokio::sync::Mutex` guarding all collections together,
/// the same way the teacher's `InMemorySessionStore` guards its map.
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, mut task: Task) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        inner.sort_order_seq += 1;
        task.sort_order = inner.sort_order_seq;
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sort_order);
        Ok(tasks)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .tasks
            .remove(id)
            .ok_or_else(|| SpiralError::NotFound(format!("task {id}")))?;
        inner.comments.remove(id);
        inner.deliverables.remove(id);
        Ok(())
    }

    async fn transaction(
        &self,
        task_id: &str,
        f: Box<dyn FnOnce(&Task) -> Result<TaskWrite> + Send>,
    ) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.tasks.get(task_id).cloned() else {
            return Ok(None);
        };

        let write = f(&current)?;

        let task = inner
            .tasks
            .get_mut(task_id)
            .expect("task present under the same lock that read it");
        write.patch.apply(task);
        if let Some(status) = write.new_status {
            task.status = status;
        }
        let committed = task.clone();

        if let Some(activity) = write.activity {
            inner.activity.push(activity);
        }

        Ok(Some(committed))
    }

    async fn add_comment(&self, comment: Comment) -> Result<Comment> {
        let mut inner = self.inner.lock().await;
        inner
            .comments
            .entry(comment.task_id.clone())
            .or_default()
            .push(comment.clone());
        Ok(comment)
    }

    async fn list_comments(&self, task_id: &str) -> Result<Vec<Comment>> {
        let inner = self.inner.lock().await;
        let mut comments = inner.comments.get(task_id).cloned().unwrap_or_default();
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn add_deliverable(&self, deliverable: Deliverable) -> Result<Deliverable> {
        let mut inner = self.inner.lock().await;
        inner
            .deliverables
            .entry(deliverable.task_id.clone())
            .or_default()
            .push(deliverable.clone());
        Ok(deliverable)
    }

    async fn list_deliverables(&self, task_id: &str) -> Result<Vec<Deliverable>> {
        let inner = self.inner.lock().await;
        Ok(inner.deliverables.get(task_id).cloned().unwrap_or_default())
    }

    async fn delete_deliverable(&self, task_id: &str, deliverable_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.deliverables.get_mut(task_id) {
            list.retain(|d| d.id != deliverable_id);
        }
        Ok(())
    }

    async fn log_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry> {
        let mut inner = self.inner.lock().await;
        inner.activity.push(entry.clone());
        Ok(entry)
    }

    async fn list_activity(&self, entry_type: Option<&str>, limit: usize) -> Result<Vec<ActivityEntry>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<ActivityEntry> = inner
            .activity
            .iter()
            .filter(|e| entry_type.map(|t| e.entry_type == t).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_workflow_settings(&self) -> Result<WorkflowSettings> {
        let inner = self.inner.lock().await;
        Ok(inner.workflow_settings.clone())
    }

    async fn set_workflow_settings(&self, settings: WorkflowSettings) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workflow_settings = settings;
        Ok(())
    }

    async fn upsert_session(&self, session: Session) -> Result<Session> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_task_round_trips() {
        let store = InMemoryStore::new();
        let task = Task::new("t1".into(), None, Priority::Medium);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();

        let fetched = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "t1");
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status() {
        let store = InMemoryStore::new();
        let mut a = Task::new("a".into(), None, Priority::Low);
        a.status = TaskStatus::InProgress;
        let b = Task::new("b".into(), None, Priority::Low);
        store.create_task(a).await.unwrap();
        store.create_task(b).await.unwrap();

        let in_progress = store
            .list_tasks(TaskFilter {
                status: Some(TaskStatus::InProgress),
                agent: None,
            })
            .await
            .unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].title, "a");
    }

    #[tokio::test]
    async fn transaction_returns_none_for_missing_task() {
        let store = InMemoryStore::new();
        let result = store
            .transaction("missing", Box::new(|_| Ok(TaskWrite::default())))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn transaction_applies_patch_status_and_activity_together() {
        let store = InMemoryStore::new();
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();

        let committed = store
            .transaction(
                &id,
                Box::new(|_current| {
                    Ok(TaskWrite {
                        patch: TaskPatch {
                            rework_count: Some(1),
                            ..Default::default()
                        },
                        new_status: Some(TaskStatus::Assigned),
                        activity: Some(ActivityEntry::new(
                            "task_status_changed",
                            None,
                            None,
                            "test",
                            serde_json::json!({}),
                        )),
                    })
                }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(committed.status, TaskStatus::Assigned);
        assert_eq!(committed.rework_count, 1);

        let activity = store.list_activity(None, 10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].entry_type, "task_status_changed");
    }

    #[tokio::test]
    async fn delete_task_cascades_comments_and_deliverables() {
        let store = InMemoryStore::new();
        let task = Task::new("t".into(), None, Priority::Low);
        let id = task.id.clone();
        store.create_task(task).await.unwrap();
        store
            .add_comment(Comment::new(id.clone(), AuthorType::User, None, "hi".into()))
            .await
            .unwrap();

        store.delete_task(&id).await.unwrap();

        assert!(store.get_task(&id).await.unwrap().is_none());
        assert!(store.list_comments(&id).await.unwrap().is_empty());
    }
}
