use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Task lifecycle. Transitions are monotonic except that `Cancelled` may be
/// entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn may_become(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => {
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskError {
    pub path: String,
    pub message: String,
}

/// Immutable progress snapshot; readers get the whole thing wait-free.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub processed: usize,
    pub total: usize,
    pub written: usize,
    pub failed: usize,
    pub errors: Vec<TaskError>,
    pub created_at: DateTime<Utc>,
}

/// One ingestion task: a mutation mutex for writers, an atomic snapshot for
/// readers, and a cancellation token observed at backend boundaries.
pub struct TaskHandle {
    snapshot: ArcSwap<TaskSnapshot>,
    mutate: std::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Cap on retained per-file errors; counters keep the full tally.
const MAX_RECORDED_ERRORS: usize = 32;

impl TaskHandle {
    fn new(task_id: String) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(TaskSnapshot {
                task_id,
                status: TaskStatus::Pending,
                processed: 0,
                total: 0,
                written: 0,
                failed: 0,
                errors: Vec::new(),
                created_at: Utc::now(),
            }),
            mutate: std::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<TaskSnapshot> {
        self.snapshot.load_full()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn update<F: FnOnce(&mut TaskSnapshot)>(&self, apply: F) {
        let _guard = self
            .mutate
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut next = (**self.snapshot.load()).clone();
        apply(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    /// Attempt a status transition; illegal moves are ignored, keeping the
    /// lifecycle monotonic under racing writers.
    pub fn transition(&self, next: TaskStatus) -> bool {
        let mut applied = false;
        self.update(|snapshot| {
            if snapshot.status.may_become(next) {
                snapshot.status = next;
                applied = true;
            }
        });
        if applied && next == TaskStatus::Cancelled {
            self.cancel.cancel();
        }
        applied
    }

    pub fn set_total(&self, total: usize) {
        self.update(|snapshot| snapshot.total = total);
    }

    pub fn record_file_done(&self, written_chunks: usize) {
        self.update(|snapshot| {
            snapshot.processed += 1;
            snapshot.written += written_chunks;
        });
    }

    pub fn record_file_failed(&self, path: &str, message: String) {
        self.update(|snapshot| {
            snapshot.processed += 1;
            snapshot.failed += 1;
            if snapshot.errors.len() < MAX_RECORDED_ERRORS {
                snapshot.errors.push(TaskError {
                    path: path.to_string(),
                    message,
                });
            }
        });
    }
}

/// In-memory task ownership; tasks live for the life of the daemon.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: std::sync::Mutex<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<TaskHandle> {
        let task_id = Uuid::new_v4().to_string();
        let handle = Arc::new(TaskHandle::new(task_id.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(task_id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.get(task_id)
            .map(|handle| handle.transition(TaskStatus::Cancelled))
            .unwrap_or(false)
    }

    /// Cancel every non-terminal task; the shutdown path.
    pub fn cancel_all(&self) {
        let handles: Vec<Arc<TaskHandle>> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.transition(TaskStatus::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_monotonic() {
        let registry = TaskRegistry::new();
        let task = registry.create();

        assert!(task.transition(TaskStatus::Running));
        assert!(task.transition(TaskStatus::Completed));
        // Terminal states are sticky.
        assert!(!task.transition(TaskStatus::Running));
        assert!(!task.transition(TaskStatus::Cancelled));
        assert_eq!(task.snapshot().status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_is_reachable_from_pending_and_running() {
        let registry = TaskRegistry::new();

        let pending = registry.create();
        assert!(pending.transition(TaskStatus::Cancelled));
        assert!(pending.is_cancelled());

        let running = registry.create();
        running.transition(TaskStatus::Running);
        assert!(running.transition(TaskStatus::Cancelled));
        assert!(running.is_cancelled());
    }

    #[test]
    fn counters_accumulate_into_snapshots() {
        let registry = TaskRegistry::new();
        let task = registry.create();
        task.set_total(3);
        task.record_file_done(4);
        task.record_file_done(2);
        task.record_file_failed("/tmp/bad.md", "unreadable".to_string());

        let snapshot = task.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.processed, 3);
        assert_eq!(snapshot.written, 6);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].path, "/tmp/bad.md");
    }

    #[test]
    fn registry_lookup_and_cancel() {
        let registry = TaskRegistry::new();
        let task = registry.create();
        let task_id = task.snapshot().task_id.clone();

        assert!(registry.get(&task_id).is_some());
        assert!(registry.cancel(&task_id));
        assert!(!registry.cancel("missing-task"));
        assert_eq!(registry.get(&task_id).expect("task").snapshot().status, TaskStatus::Cancelled);
    }
}
