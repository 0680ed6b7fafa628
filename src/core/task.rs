use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task. See the state machine in the component design
/// doc: `pending -> running -> {completed, failed, interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl TaskState {
    /// Terminal states are sinks: no further transition is valid.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Interrupted
        )
    }
}

/// Client-supplied correlation metadata attached at `spawn` time.
pub type Tags = std::collections::HashMap<String, String>;

/// The central entity: one child process under supervision, plus its
/// derived counters. Cloning produces an immutable point-in-time snapshot;
/// the live record lives in the registry behind a per-task mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Short annotation set on certain terminal transitions, e.g.
    /// `backpressure_timeout` or a signal name. Absent for a plain exit.
    pub reason: Option<String>,
    pub line_count: u64,
    pub byte_count: u64,
    pub intervention_count: u32,
    pub tags: Tags,
}

impl Task {
    pub fn new(id: String, prompt: String, tags: Tags) -> Self {
        Self {
            id,
            prompt,
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            reason: None,
            line_count: 0,
            byte_count: 0,
            intervention_count: 0,
            tags,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_terminal(&mut self, state: TaskState, exit_code: Option<i32>, reason: Option<String>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.exit_code = exit_code;
        self.reason = reason;
        self.ended_at = Some(Utc::now());
    }
}

/// Monotonic wall-clock bookkeeping kept alongside a `Task` but never
/// serialized — used for cooldown/backpressure/stall arithmetic, where
/// `Instant` (not `DateTime<Utc>`, which can jump on clock adjustment)
/// is the correct tool.
#[derive(Debug, Clone, Copy)]
pub struct TaskClock {
    pub last_output_at: Instant,
    /// Last time the Intervention Controller delivered an injection to
    /// this task, for `min_delivery_spacing` accounting. Distinct from
    /// the per-rule cooldown the pattern scanner tracks: this one
    /// applies across *all* rules on the task.
    pub last_delivery_at: Option<Instant>,
}

impl TaskClock {
    pub fn new() -> Self {
        Self {
            last_output_at: Instant::now(),
            last_delivery_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_output_at = Instant::now();
    }
}

impl Default for TaskClock {
    fn default() -> Self {
        Self::new()
    }
}
