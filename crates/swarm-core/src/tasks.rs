//! Task state machine and store (spec §4.I): lifecycle of work items with
//! validated transitions and an append-only history. Grounded on
//! `examples/original_source/src/claudeswarm/tasks.py`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SwarmError};
use crate::paths;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Working,
    Review,
    Completed,
    Blocked,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Allowed next states (spec §4.I's transition table).
    fn allowed_next(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Assigned, Cancelled],
            Assigned => &[Working, Blocked, Cancelled, Pending],
            Working => &[Review, Blocked, Failed, Cancelled, Completed],
            Review => &[Completed, Working, Failed, Cancelled],
            Blocked => &[Pending, Assigned, Working, Cancelled, Failed],
            Failed => &[Pending],
            Completed => &[],
            Cancelled => &[],
        }
    }

    fn can_transition_to(self, next: TaskStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Sort weight: critical first, then high, normal, low (spec §4.I listing
/// order). `TaskPriority`'s derived `Ord` is ascending (low < critical), the
/// opposite of listing order, so callers sort by `sort_rank()` ascending.
impl TaskPriority {
    fn sort_rank(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub objective: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub blocks: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TasksFile {
    #[serde(default = "schema_version")]
    version: String,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    tasks: Vec<Task>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
    pub context_id: Option<String>,
    pub priority: Option<TaskPriority>,
    pub include_terminal: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: std::collections::HashMap<String, usize>,
    pub by_priority: std::collections::HashMap<String, usize>,
}

pub struct TaskStore<'a> {
    root: &'a Path,
}

impl<'a> TaskStore<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    fn path(&self) -> std::path::PathBuf {
        paths::tasks_path(self.root)
    }

    /// Create a new task in `pending`, with an empty history (the initial
    /// state has no transition to record).
    pub fn create(
        &self,
        objective: &str,
        created_by: &str,
        priority: TaskPriority,
        context_id: Option<String>,
        constraints: Vec<String>,
        files: Vec<String>,
        parent_task_id: Option<Uuid>,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            objective: objective.to_string(),
            status: TaskStatus::Pending,
            priority,
            created_by: created_by.to_string(),
            assigned_to: None,
            context_id,
            constraints,
            files,
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            result: None,
            error: None,
            history: Vec::new(),
            parent_task_id,
            created_at: now,
            updated_at: now,
        };
        self.insert(task.clone())?;
        Ok(task)
    }

    fn insert(&self, task: Task) -> Result<()> {
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: TasksFile| {
            file.tasks.push(task.clone());
            file.updated_at = Utc::now();
            Ok(file)
        })?;
        Ok(())
    }

    fn get(&self, task_id: Uuid) -> Result<Task> {
        let file: TasksFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        file.tasks
            .into_iter()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))
    }

    /// Apply `s -> s'` recording a history entry, rejecting transitions not
    /// in the table (spec §4.I). Internal helper behind every public
    /// mutation below.
    fn transition_inner(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        agent_id: Option<&str>,
        message: Option<&str>,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        store::write_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT, |mut file: TasksFile| {
            let task = file
                .tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))?;
            if !task.status.can_transition_to(to) {
                return Err(SwarmError::Conflict(format!(
                    "invalid-transition: {:?} -> {:?}",
                    task.status, to
                )));
            }
            let now = Utc::now();
            task.history.push(HistoryEntry {
                timestamp: now,
                from: task.status,
                to,
                agent_id: agent_id.map(str::to_string),
                message: message.map(str::to_string),
                metadata: Value::Null,
            });
            task.status = to;
            task.updated_at = now;
            mutate(task);
            file.updated_at = now;
            Ok(file)
        })?
        .tasks
        .into_iter()
        .find(|t| t.task_id == task_id)
        .ok_or_else(|| SwarmError::NotFound(format!("task {task_id}")))
    }

    /// Assign a pending task to `agent_id`: transitions to `assigned`.
    pub fn assign(&self, task_id: Uuid, agent_id: &str) -> Result<Task> {
        let agent_id = agent_id.to_string();
        self.transition_inner(task_id, TaskStatus::Assigned, Some(&agent_id), None, |task| {
            task.assigned_to = Some(agent_id.clone());
        })
    }

    /// Generic transition, used for `working`/`review`/`blocked`/etc.
    pub fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        agent_id: &str,
        message: Option<&str>,
    ) -> Result<Task> {
        self.transition_inner(task_id, to, Some(agent_id), message, |_| {})
    }

    pub fn complete(&self, task_id: Uuid, agent_id: &str, result: Value) -> Result<Task> {
        self.transition_inner(task_id, TaskStatus::Completed, Some(agent_id), None, |task| {
            task.result = Some(result.clone());
        })
    }

    pub fn fail(&self, task_id: Uuid, agent_id: &str, error: &str) -> Result<Task> {
        let error = error.to_string();
        self.transition_inner(task_id, TaskStatus::Failed, Some(agent_id), None, |task| {
            task.error = Some(error.clone());
        })
    }

    pub fn block(&self, task_id: Uuid, agent_id: &str, reason: &str) -> Result<Task> {
        self.transition_inner(task_id, TaskStatus::Blocked, Some(agent_id), Some(reason), |_| {})
    }

    /// Unblock a task: returns to `assigned` if there's an assignee,
    /// otherwise `pending` (spec §4.I).
    pub fn unblock(&self, task_id: Uuid, agent_id: &str) -> Result<Task> {
        let task = self.get(task_id)?;
        let target = if task.assigned_to.is_some() {
            TaskStatus::Assigned
        } else {
            TaskStatus::Pending
        };
        self.transition_inner(task_id, target, Some(agent_id), None, |_| {})
    }

    pub fn cancel(&self, task_id: Uuid, agent_id: &str) -> Result<Task> {
        self.transition_inner(task_id, TaskStatus::Cancelled, Some(agent_id), None, |_| {})
    }

    /// List tasks matching `filter`, sorted by priority (critical first)
    /// then by `created_at` ascending.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let file: TasksFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        let mut tasks: Vec<Task> = file
            .tasks
            .into_iter()
            .filter(|t| filter.include_terminal || !t.status.is_terminal())
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| {
                filter
                    .assigned_to
                    .as_ref()
                    .map(|a| t.assigned_to.as_deref() == Some(a.as_str()))
                    .unwrap_or(true)
            })
            .filter(|t| {
                filter
                    .created_by
                    .as_ref()
                    .map(|c| t.created_by == *c)
                    .unwrap_or(true)
            })
            .filter(|t| {
                filter
                    .context_id
                    .as_ref()
                    .map(|c| t.context_id.as_deref() == Some(c.as_str()))
                    .unwrap_or(true)
            })
            .filter(|t| filter.priority.map(|p| p == t.priority).unwrap_or(true))
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .sort_rank()
                .cmp(&b.priority.sort_rank())
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    pub fn subtasks(&self, parent_task_id: Uuid) -> Result<Vec<Task>> {
        let file: TasksFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        Ok(file
            .tasks
            .into_iter()
            .filter(|t| t.parent_task_id == Some(parent_task_id))
            .collect())
    }

    pub fn context_tasks(&self, context_id: &str) -> Result<Vec<Task>> {
        self.list(&TaskFilter {
            context_id: Some(context_id.to_string()),
            include_terminal: true,
            ..Default::default()
        })
    }

    pub fn stats(&self) -> Result<TaskStats> {
        let file: TasksFile = store::read_locked(&self.path(), store::DEFAULT_LOCK_TIMEOUT)?;
        let mut stats = TaskStats {
            total: file.tasks.len(),
            ..Default::default()
        };
        for task in &file.tasks {
            let status_key = serde_json::to_value(task.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *stats.by_status.entry(status_key).or_insert(0) += 1;
            let priority_key = serde_json::to_value(task.priority)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *stats.by_priority.entry(priority_key).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn full_lifecycle_matches_literal_scenario() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::new(tmp.path());

        let task = store
            .create("x", "agent-0", TaskPriority::High, None, vec![], vec![], None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let task = store.assign(task.task_id, "agent-1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_to.as_deref(), Some("agent-1"));

        let task = store
            .transition(task.task_id, TaskStatus::Working, "agent-1", None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Working);

        let task = store
            .complete(task.task_id, "agent-1", serde_json::json!({"status": "success"}))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.history.len(), 3);

        let err = store
            .transition(task.task_id, TaskStatus::Pending, "agent-1", None)
            .unwrap_err();
        assert!(matches!(err, SwarmError::Conflict(_)));
    }

    #[test]
    fn unblock_returns_to_assigned_when_assignee_present() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::new(tmp.path());
        let task = store
            .create("x", "agent-0", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();
        let task = store.assign(task.task_id, "agent-1").unwrap();
        let task = store.block(task.task_id, "agent-1", "waiting on review").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        let task = store.unblock(task.task_id, "agent-1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[test]
    fn unblock_returns_to_pending_without_assignee() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::new(tmp.path());
        let task = store
            .create("x", "agent-0", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();
        let task = store.assign(task.task_id, "agent-1").unwrap();
        let task = store.block(task.task_id, "agent-1", "waiting").unwrap();
        // Simulate the assignee dropping off by transitioning through a
        // failed/pending cycle, clearing assigned_to along the way.
        let task = store
            .transition(task.task_id, TaskStatus::Failed, "agent-1", None)
            .unwrap();
        let task = store
            .transition(task.task_id, TaskStatus::Pending, "agent-1", None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn list_sorts_by_priority_then_created_at() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::new(tmp.path());
        store
            .create("low", "agent-0", TaskPriority::Low, None, vec![], vec![], None)
            .unwrap();
        store
            .create("critical", "agent-0", TaskPriority::Critical, None, vec![], vec![], None)
            .unwrap();
        store
            .create("normal", "agent-0", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();

        let tasks = store.list(&TaskFilter::default()).unwrap();
        assert_eq!(tasks[0].objective, "critical");
        assert_eq!(tasks[1].objective, "normal");
        assert_eq!(tasks[2].objective, "low");
    }

    #[test]
    fn terminal_tasks_excluded_unless_requested() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::new(tmp.path());
        let task = store
            .create("x", "agent-0", TaskPriority::Normal, None, vec![], vec![], None)
            .unwrap();
        store.cancel(task.task_id, "agent-0").unwrap();

        let visible = store.list(&TaskFilter::default()).unwrap();
        assert!(visible.is_empty());

        let all = store
            .list(&TaskFilter {
                include_terminal: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
