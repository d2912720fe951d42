//! C10 — Task Manager: an owner-scoped, TTL-bounded registry for long-running
//! tool invocations, with cursor-paginated listing and one-shot terminal
//! notification.
//!
//! The owner/TTL/capacity shape mirrors `fetchguard-local::cache::Cache`
//! (TTL eviction, `Mutex<HashMap<..>>`) and the opaque-cursor convention is
//! grounded on `fetchguard-core`'s existing `sha2`/`hex`/`base64` hashing
//! stack.
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use fetchguard_core::{ErrorKind, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

struct TaskRecord {
    id: String,
    owner: String,
    state: TaskState,
    result: Option<Value>,
    error: Option<String>,
    created_at: Instant,
    ttl: Duration,
    notify: Arc<tokio::sync::Notify>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<&TaskRecord> for TaskView {
    fn from(r: &TaskRecord) -> Self {
        Self { id: r.id.clone(), state: r.state, result: r.result.clone(), error: r.error.clone() }
    }
}

fn is_expired(record: &TaskRecord, now: Instant) -> bool {
    now.duration_since(record.created_at) >= record.ttl
}

#[derive(Serialize, Deserialize)]
struct Cursor {
    after_id: String,
}

fn encode_cursor(after_id: &str) -> String {
    URL_SAFE.encode(serde_json::to_vec(&Cursor { after_id: after_id.to_string() }).unwrap_or_default())
}

fn decode_cursor(cursor: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(cursor).ok()?;
    let parsed: Cursor = serde_json::from_slice(&bytes).ok()?;
    Some(parsed.after_id)
}

pub struct TaskPage {
    pub items: Vec<TaskView>,
    pub next_cursor: Option<String>,
}

pub struct TaskManager {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    /// Insertion order, oldest first, for deterministic cursor pagination.
    order: Mutex<Vec<String>>,
    max_total: usize,
    max_per_owner: usize,
}

impl TaskManager {
    pub fn new(max_total: usize, max_per_owner: usize) -> Self {
        Self { tasks: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), max_total, max_per_owner }
    }

    fn owner_count_locked(tasks: &HashMap<String, TaskRecord>, owner: &str) -> usize {
        tasks.values().filter(|t| t.owner == owner).count()
    }

    pub fn create_task(&self, owner: &str, ttl: Duration) -> Result<String, FetchError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.len() >= self.max_total {
            return Err(FetchError::new(ErrorKind::ServerBusy, "task registry is at capacity").with_status(503));
        }
        if Self::owner_count_locked(&tasks, owner) >= self.max_per_owner {
            return Err(FetchError::new(ErrorKind::ServerBusy, "owner has too many in-flight tasks").with_status(503));
        }
        let id = Uuid::new_v4().to_string();
        tasks.insert(
            id.clone(),
            TaskRecord {
                id: id.clone(),
                owner: owner.to_string(),
                state: TaskState::Working,
                result: None,
                error: None,
                created_at: Instant::now(),
                ttl,
                notify: Arc::new(tokio::sync::Notify::new()),
            },
        );
        self.order.lock().unwrap_or_else(|e| e.into_inner()).push(id.clone());
        Ok(id)
    }

    /// Ownership and TTL are enforced together: a task belonging to another
    /// owner, or one whose TTL has elapsed, is indistinguishable from a
    /// missing one to the caller.
    pub fn get_task(&self, id: &str, owner: &str) -> Option<TaskView> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let record = tasks.get(id)?;
        if record.owner != owner || is_expired(record, Instant::now()) {
            return None;
        }
        Some(record.into())
    }

    /// No-op on a task already in a terminal state, per spec.
    pub fn update_task(&self, id: &str, patch: TaskPatch) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = tasks.get_mut(id) else { return };
        if record.state.is_terminal() {
            return;
        }
        if let Some(state) = patch.state {
            record.state = state;
        }
        if patch.result.is_some() {
            record.result = patch.result;
        }
        if patch.error.is_some() {
            record.error = patch.error;
        }
        let became_terminal = record.state.is_terminal();
        let notify = record.notify.clone();
        drop(tasks);
        if became_terminal {
            notify.notify_waiters();
        }
    }

    pub fn cancel_task(&self, id: &str, owner: &str) -> Result<(), FetchError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = tasks.get_mut(id) else {
            return Err(FetchError::new(ErrorKind::ValidationError, "task not found").with_status(404));
        };
        if record.owner != owner {
            return Err(FetchError::new(ErrorKind::ValidationError, "task not found").with_status(404));
        }
        if record.state.is_terminal() {
            return Err(FetchError::new(ErrorKind::ValidationError, "task is already in a terminal state").with_status(400));
        }
        record.state = TaskState::Cancelled;
        let notify = record.notify.clone();
        drop(tasks);
        notify.notify_waiters();
        Ok(())
    }

    pub fn list_tasks(&self, owner: &str, cursor: Option<&str>, limit: usize) -> TaskPage {
        let after_id = cursor.and_then(decode_cursor);
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let mut skipping = after_id.is_some();
        let mut items = Vec::new();
        let mut next_cursor = None;
        for id in order.iter() {
            if skipping {
                if Some(id.as_str()) == after_id.as_deref() {
                    skipping = false;
                }
                continue;
            }
            let Some(record) = tasks.get(id) else { continue };
            if record.owner != owner {
                continue;
            }
            if items.len() == limit {
                next_cursor = Some(encode_cursor(id));
                break;
            }
            items.push(record.into());
        }
        TaskPage { items, next_cursor }
    }

    /// Resolves as soon as the task reaches a terminal state, the deadline
    /// elapses, or `cancel` fires — whichever comes first.
    pub async fn wait_for_terminal_task(&self, id: &str, owner: &str, deadline: Duration, cancel: &CancellationToken) -> Option<TaskView> {
        loop {
            let (view, notify) = {
                let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                let record = tasks.get(id)?;
                if record.owner != owner {
                    return None;
                }
                if record.state.is_terminal() {
                    return Some(record.into());
                }
                (TaskView::from(record), record.notify.clone())
            };
            let _ = view;
            tokio::select! {
                _ = notify.notified() => continue,
                _ = tokio::time::sleep(deadline) => return self.get_task(id, owner),
                _ = cancel.cancelled() => return self.get_task(id, owner),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let mgr = TaskManager::new(100, 10);
        let id = mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        let view = mgr.get_task(&id, "alice").unwrap();
        assert_eq!(view.state, TaskState::Working);
    }

    #[test]
    fn get_task_hides_other_owners_tasks() {
        let mgr = TaskManager::new(100, 10);
        let id = mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        assert!(mgr.get_task(&id, "bob").is_none());
    }

    #[test]
    fn update_is_noop_after_terminal() {
        let mgr = TaskManager::new(100, 10);
        let id = mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        mgr.update_task(&id, TaskPatch { state: Some(TaskState::Completed), result: Some(serde_json::json!(1)), error: None });
        mgr.update_task(&id, TaskPatch { state: Some(TaskState::Failed), result: None, error: Some("late".into()) });
        let view = mgr.get_task(&id, "alice").unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert!(view.error.is_none());
    }

    #[test]
    fn cancel_fails_on_already_terminal_task() {
        let mgr = TaskManager::new(100, 10);
        let id = mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        mgr.update_task(&id, TaskPatch { state: Some(TaskState::Completed), result: None, error: None });
        assert!(mgr.cancel_task(&id, "alice").is_err());
    }

    #[test]
    fn max_per_owner_is_enforced() {
        let mgr = TaskManager::new(100, 1);
        mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        assert!(mgr.create_task("alice", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn list_tasks_paginates_with_opaque_cursor() {
        let mgr = TaskManager::new(100, 100);
        let ids: Vec<String> = (0..5).map(|_| mgr.create_task("alice", Duration::from_secs(60)).unwrap()).collect();
        let page1 = mgr.list_tasks("alice", None, 2);
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.items[0].id, ids[0]);
        let cursor = page1.next_cursor.unwrap();
        assert!(cursor.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
        let page2 = mgr.list_tasks("alice", Some(&cursor), 2);
        assert_eq!(page2.items[0].id, ids[2]);
    }

    #[tokio::test]
    async fn wait_for_terminal_task_resolves_on_transition() {
        let mgr = Arc::new(TaskManager::new(100, 10));
        let id = mgr.create_task("alice", Duration::from_secs(60)).unwrap();
        let waiter_mgr = mgr.clone();
        let waiter_id = id.clone();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            waiter_mgr.wait_for_terminal_task(&waiter_id, "alice", Duration::from_secs(5), &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.update_task(&id, TaskPatch { state: Some(TaskState::Completed), result: Some(serde_json::json!("done")), error: None });
        let view = handle.await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Completed);
    }
}
