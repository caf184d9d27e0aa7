use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of a task, highest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Status of a task in the lifecycle engine. See the state machine (C4) for
/// the guarded transition graph between these values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Inbox,
    Planning,
    Assigned,
    InProgress,
    Testing,
    Review,
    Done,
}

impl TaskStatus {
    /// The guarded transition graph from §4.4. `bypassGuards` callers do not
    /// consult this table.
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Inbox => &[Planning, Assigned, Done],
            Planning => &[Inbox, Assigned],
            Assigned => &[Inbox, InProgress, Testing, Review, Done],
            InProgress => &[Assigned, Testing, Review, Done],
            Testing => &[Assigned, InProgress, Review, Done],
            Review => &[Assigned, InProgress, Done],
            Done => &[Review],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

/// The primary entity. Field grouping follows the data model: identity/content,
/// status, assignment, dispatch claim, planning, orchestration, ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,

    pub status: TaskStatus,

    pub assigned_agent_id: Option<String>,
    pub openclaw_session_key: Option<String>,

    pub dispatch_id: Option<String>,
    pub dispatch_started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub dispatch_message_count_start: u32,

    pub planning_session_key: Option<String>,
    pub planning_messages: Option<String>,
    pub planning_complete: bool,
    pub planning_spec: Option<String>,
    pub planning_dispatch_error: Option<String>,
    pub planning_question_waiting: bool,

    pub orchestrator_session_key: Option<String>,
    pub tester_session_key: Option<String>,
    pub rework_count: u32,

    pub sort_order: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Creates a new task in `inbox`, per the "Task is created in inbox" lifecycle rule.
    pub fn new(title: String, description: Option<String>, priority: Priority) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            description,
            priority,
            status: TaskStatus::Inbox,
            assigned_agent_id: None,
            openclaw_session_key: None,
            dispatch_id: None,
            dispatch_started_at: None,
            dispatch_message_count_start: 0,
            planning_session_key: None,
            planning_messages: None,
            planning_complete: false,
            planning_spec: None,
            planning_dispatch_error: None,
            planning_question_waiting: false,
            orchestrator_session_key: None,
            tester_session_key: None,
            rework_count: 0,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Task invariants (1)-(2) from §3, checked defensively in tests and
    /// debug assertions rather than on every read.
    pub fn invariants_hold(&self) -> bool {
        let dispatch_paired =
            self.dispatch_id.is_some() == self.dispatch_started_at.is_some();
        let assignment_required = !matches!(
            self.status,
            TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Testing
        ) || (self.assigned_agent_id.is_some() && self.openclaw_session_key.is_some());
        dispatch_paired && assignment_required
    }
}

/// A partial update to a Task. `None` fields are left untouched; `status` is
/// intentionally absent — status changes must go through the state machine (C4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub assigned_agent_id: Option<Option<String>>,
    pub openclaw_session_key: Option<Option<String>>,
    pub dispatch_id: Option<Option<String>>,
    pub dispatch_started_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
    pub dispatch_message_count_start: Option<u32>,
    pub planning_session_key: Option<Option<String>>,
    pub planning_messages: Option<Option<String>>,
    pub planning_complete: Option<bool>,
    pub planning_spec: Option<Option<String>>,
    pub planning_dispatch_error: Option<Option<String>>,
    pub planning_question_waiting: Option<bool>,
    pub orchestrator_session_key: Option<Option<String>>,
    pub tester_session_key: Option<Option<String>>,
    pub rework_count: Option<u32>,
    pub sort_order: Option<i64>,
}

impl TaskPatch {
    pub fn apply(&self, task: &mut Task) {
        macro_rules! patch {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    task.$field = v;
                }
            };
        }
        patch!(title);
        patch!(description);
        patch!(priority);
        patch!(assigned_agent_id);
        patch!(openclaw_session_key);
        patch!(dispatch_id);
        patch!(dispatch_started_at);
        patch!(dispatch_message_count_start);
        patch!(planning_session_key);
        patch!(planning_messages);
        patch!(planning_complete);
        patch!(planning_spec);
        patch!(planning_dispatch_error);
        patch!(planning_question_waiting);
        patch!(orchestrator_session_key);
        patch!(tester_session_key);
        patch!(rework_count);
        patch!(sort_order);
        task.updated_at = chrono::Utc::now();
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.assigned_agent_id.is_none()
            && self.openclaw_session_key.is_none()
            && self.dispatch_id.is_none()
            && self.dispatch_started_at.is_none()
            && self.dispatch_message_count_start.is_none()
            && self.planning_session_key.is_none()
            && self.planning_messages.is_none()
            && self.planning_complete.is_none()
            && self.planning_spec.is_none()
            && self.planning_dispatch_error.is_none()
            && self.planning_question_waiting.is_none()
            && self.orchestrator_session_key.is_none()
            && self.tester_session_key.is_none()
            && self.rework_count.is_none()
            && self.sort_order.is_none()
    }
}

/// Who authored a Comment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    Agent,
    User,
    System,
}

/// Append-only note attached to a task, ordered by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub author_type: AuthorType,
    pub agent_id: Option<String>,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Comment {
    pub fn new(task_id: String, author_type: AuthorType, agent_id: Option<String>, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            author_type,
            agent_id,
            content,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableType {
    File,
    Url,
    Artifact,
}

/// An artifact produced by a task's agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    pub task_id: String,
    pub deliverable_type: DeliverableType,
    pub title: String,
    pub path: Option<String>,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Deliverable {
    pub fn new(
        task_id: String,
        deliverable_type: DeliverableType,
        title: String,
        path: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            deliverable_type,
            title,
            path,
            description,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Machine-readable audit trail entry. `entry_type` is a free-form tag
/// (`task_status_changed`, `task_completion_gate_rejected`, `task_reconciled`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub entry_type: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ActivityEntry {
    pub fn new(
        entry_type: impl Into<String>,
        task_id: Option<String>,
        agent_id: Option<String>,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entry_type: entry_type.into(),
            task_id,
            agent_id,
            message: message.into(),
            metadata,
            created_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Dispatch,
    Orchestrator,
    Tester,
    Planning,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// A record of a chat-gateway session opened on behalf of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub openclaw_session_id: String,
    pub session_type: SessionType,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new(
        openclaw_session_id: String,
        session_type: SessionType,
        task_id: Option<String>,
        agent_id: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            openclaw_session_id,
            session_type,
            task_id,
            agent_id,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Singleton, process-wide workflow configuration, read on every routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub orchestrator_agent_id: Option<String>,
    pub planner_agent_id: Option<String>,
    pub tester_agent_id: Option<String>,
    pub max_rework_cycles: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            orchestrator_agent_id: None,
            planner_agent_id: None,
            tester_agent_id: None,
            max_rework_cycles: 3,
        }
    }
}

impl WorkflowSettings {
    pub fn with_max_rework_cycles(mut self, n: u32) -> Self {
        self.max_rework_cycles = n.min(10);
        self
    }
}
