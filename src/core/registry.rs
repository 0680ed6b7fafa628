//! Task registry and per-task record (component E).
//!
//! A thread-safe map from task-id to task record. The map itself is a
//! `DashMap` (sharded internally, so `insert`/`lookup`/`list`/`remove`
//! never contend on a single global lock); each record's mutable state
//! — the `Task` snapshot fields, the pattern scanner's carry buffer, the
//! per-task clock used for stall/cooldown arithmetic — sits behind its
//! own `Mutex` so a reader observes either the state before a transition
//! or the state after, never a partially mutated record.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

use crate::core::executor::PtyExecutor;
use crate::core::output_log::{OutputLog, RingBuffer};
use crate::core::pattern_scanner::PatternScanner;
use crate::core::task::{Task, TaskClock, TaskState, Tags};

/// Everything the registry owns for one task. The executor handle is
/// `Some` for exactly the lifetime of a live child: one executor handle
/// per live task, released before the terminal `state-change` event
/// fires.
pub struct TaskRecord {
    pub task: Mutex<Task>,
    pub executor: Mutex<Option<Arc<PtyExecutor>>>,
    pub output_log: OutputLog,
    pub ring_buffer: RingBuffer,
    pub scanner: Mutex<PatternScanner>,
    pub clock: Mutex<TaskClock>,
    /// Serializes writes to this task's stdin so two concurrent `send`s
    /// (or a `send` racing an intervention injection) never interleave.
    pub write_lock: tokio::sync::Mutex<()>,
    /// Set by the `interrupt` RPC so the exit watcher can distinguish an
    /// intervention-requested exit from a plain completion/failure when
    /// the child finally dies.
    pub interrupted: AtomicBool,
}

impl TaskRecord {
    fn new(task: Task, ring_buffer_bytes: usize, scanner: PatternScanner) -> Self {
        Self {
            task: Mutex::new(task),
            executor: Mutex::new(None),
            output_log: OutputLog::new(),
            ring_buffer: RingBuffer::new(ring_buffer_bytes),
            scanner: Mutex::new(scanner),
            clock: Mutex::new(TaskClock::new()),
            write_lock: tokio::sync::Mutex::new(()),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Point-in-time snapshot suitable for the `status` RPC.
    pub fn snapshot(&self) -> Task {
        self.task.lock().unwrap().clone()
    }
}

/// Thread-safe map of task-id to task record. Task ids are v4 UUIDs:
/// opaque, never reused, and collision-free across a supervisor's
/// lifetime without coordinating a shared counter.
pub struct Registry {
    tasks: DashMap<String, Arc<TaskRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Allocates a fresh id and inserts a `pending` record for it.
    /// Returns the new record so the caller (the router's `spawn`
    /// handler) can attach the executor without a second map lookup.
    pub fn insert(
        &self,
        prompt: String,
        tags: Tags,
        ring_buffer_bytes: usize,
        scanner: PatternScanner,
    ) -> Arc<TaskRecord> {
        let id = format!("task-{}", Uuid::new_v4());
        let task = Task::new(id.clone(), prompt, tags);
        let record = Arc::new(TaskRecord::new(task, ring_buffer_bytes, scanner));
        self.tasks.insert(id, record.clone());
        record
    }

    pub fn lookup(&self, task_id: &str) -> Option<Arc<TaskRecord>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    /// Snapshots of every task in the registry. Order is not guaranteed —
    /// only per-task ordering is required, never cross-task ordering.
    pub fn list(&self) -> Vec<Task> {
        self.tasks.iter().map(|e| e.value().snapshot()).collect()
    }

    /// All records currently in `running` state, for the stall ticker.
    pub fn running_tasks(&self) -> Vec<(String, Arc<TaskRecord>)> {
        self.tasks
            .iter()
            .filter(|e| e.value().task.lock().unwrap().state == TaskState::Running)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Eviction is otherwise client-driven (an orchestrator decides when a
    /// completed task's record can go); the one caller inside this crate
    /// is `Router::spawn`'s synchronous-failure path, which rolls back the
    /// just-inserted `pending` record when the executor fails to launch.
    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskRecord>> {
        self.tasks.remove(task_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> PatternScanner {
        PatternScanner::new(Vec::new(), 8192)
    }

    #[test]
    fn inserted_ids_are_unique_and_never_reused() {
        let registry = Registry::new();
        let a = registry.insert("p1".to_string(), Tags::new(), 1024, scanner());
        let b = registry.insert("p2".to_string(), Tags::new(), 1024, scanner());
        assert_ne!(a.snapshot().id, b.snapshot().id);
    }

    #[test]
    fn lookup_finds_inserted_task() {
        let registry = Registry::new();
        let record = registry.insert("p1".to_string(), Tags::new(), 1024, scanner());
        let id = record.snapshot().id;
        assert!(registry.lookup(&id).is_some());
        assert!(registry.lookup("does-not-exist").is_none());
    }

    #[test]
    fn running_tasks_filters_by_state() {
        let registry = Registry::new();
        let record = registry.insert("p1".to_string(), Tags::new(), 1024, scanner());
        assert_eq!(registry.running_tasks().len(), 0, "pending task is not running");
        record.task.lock().unwrap().mark_running();
        assert_eq!(registry.running_tasks().len(), 1);
    }

    #[test]
    fn list_returns_all_tasks() {
        let registry = Registry::new();
        registry.insert("p1".to_string(), Tags::new(), 1024, scanner());
        registry.insert("p2".to_string(), Tags::new(), 1024, scanner());
        assert_eq!(registry.list().len(), 2);
    }
}
