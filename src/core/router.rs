//! Request router (component F).
//!
//! Dispatches the five public operations against the registry. `spawn`
//! is the operation with the distinguishing contract: it returns as soon
//! as the executor reports `running`, never waiting for the child to
//! complete, so the orchestrating client can issue further RPCs against
//! this or other task-ids while children run in the background.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::bus::{Bus, Event};
use crate::core::error::TaskError;
use crate::core::executor::{ExitReason, PtyExecutor};
use crate::core::intervention::InterventionController;
use crate::core::pattern_scanner::{PatternScanner, Rule};
use crate::core::registry::{Registry, TaskRecord};
use crate::core::task::{Task, TaskState, Tags};

/// `opts` accepted by `spawn`. `verbose` is accepted for wire
/// compatibility with the orchestrator's "verbose master mode" flag but
/// does not change behavior: this router is unconditionally non-blocking,
/// regardless of what the flag name suggests.
#[derive(Debug, Clone, Deserialize)]
pub struct SpawnOpts {
    #[serde(default = "default_verbose")]
    pub verbose: bool,
    #[serde(default)]
    pub tags: Tags,
}

fn default_verbose() -> bool {
    true
}

impl Default for SpawnOpts {
    fn default() -> Self {
        Self {
            verbose: true,
            tags: Tags::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnResult {
    pub task_id: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputResult {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputOpts {
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterruptOpts {
    #[serde(default)]
    pub force: bool,
}

/// Owns the process-wide state the five operations act on: the task
/// registry, the notification bus, the resolved configuration, and the
/// intervention controller. One instance lives for the process lifetime
/// and is handed explicitly to the RPC layer — no module-level globals.
pub struct Router {
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    config: Arc<Config>,
    controller: Arc<InterventionController>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            bus: Arc::new(Bus::new()),
            controller: Arc::new(InterventionController::new(
                config.max_interventions_per_task,
                config.min_delivery_spacing,
            )),
            config,
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<InterventionController> {
        &self.controller
    }

    /// Launches a new task. Returns once the child has been forked and
    /// the task is `running` — it does not wait for output or exit.
    pub fn spawn(&self, prompt: String, opts: SpawnOpts) -> Result<SpawnResult, TaskError> {
        if prompt.trim().is_empty() {
            return Err(TaskError::invalid_request("prompt must not be empty"));
        }

        let scanner = PatternScanner::new(self.config.rules.clone(), self.config.max_line_bytes);
        let record = self.registry.insert(
            prompt.clone(),
            opts.tags,
            self.config.ring_buffer_bytes,
            scanner,
        );
        let task_id = record.snapshot().id;

        let (hit_tx, mut hit_rx) = tokio::sync::mpsc::unbounded_channel::<(String, Rule)>();

        {
            let record = record.clone();
            let bus = self.bus.clone();
            let controller = self.controller.clone();
            // Dedicated consumer so hits from the same task are applied to
            // the child in the order the scanner produced them, even
            // though delivery itself needs an async stdin-lock acquisition
            // the synchronous `on_bytes` callback cannot perform inline.
            tokio::spawn(async move {
                while let Some((rule_id, rule)) = hit_rx.recv().await {
                    controller.handle(&record, &bus, &rule_id, &rule.action).await;
                }
            });
        }

        let on_bytes = {
            let record = record.clone();
            let bus = self.bus.clone();
            let task_id = task_id.clone();
            let rules = self.config.rules.clone();
            Box::new(move |chunk: &[u8]| {
                record.clock.lock().unwrap().touch();
                record.ring_buffer.push(chunk);

                let newlines = chunk.iter().filter(|&&b| b == b'\n').count() as u64;
                record.output_log.append(chunk, newlines);
                {
                    let mut task = record.task.lock().unwrap();
                    task.byte_count = record.output_log.byte_count();
                    task.line_count = record.output_log.line_count();
                }
                bus.publish(Event::OutputChunk {
                    task_id: task_id.clone(),
                    bytes: chunk.to_vec(),
                    ts: Utc::now(),
                });

                let hits = record.scanner.lock().unwrap().feed(chunk).hits;
                for hit in hits {
                    bus.publish(Event::PatternHit {
                        task_id: task_id.clone(),
                        rule_id: hit.rule_id.clone(),
                        matched_text: hit.matched_text.clone(),
                        ts: Utc::now(),
                    });
                    if let Some(rule) = rules.iter().find(|r| r.id == hit.rule_id) {
                        let _ = hit_tx.send((hit.rule_id, rule.clone()));
                    }
                }
            }) as crate::core::executor::BytesCallback
        };

        let executor = PtyExecutor::launch(
            &self.config.child.command,
            &self.config.child.args,
            &prompt,
            self.config.child.cwd.as_deref(),
            &self.config.child.env,
            self.config.backpressure_timeout,
            on_bytes,
        );

        let executor = match executor {
            Ok(executor) => Arc::new(executor),
            Err(e) => {
                self.registry.remove(&task_id);
                return Err(e);
            }
        };

        *record.executor.lock().unwrap() = Some(executor);
        let old = {
            let mut task = record.task.lock().unwrap();
            let old = task.state;
            task.mark_running();
            old
        };
        self.bus.publish(Event::StateChange {
            task_id: task_id.clone(),
            old,
            new: TaskState::Running,
            ts: Utc::now(),
            exit_code: None,
            reason: None,
        });

        {
            let record = record.clone();
            let bus = self.bus.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                watch_exit(record, bus, task_id).await;
            });
        }

        Ok(SpawnResult {
            task_id,
            state: TaskState::Running,
        })
    }

    /// Writes `message + "\r"` to the child's stdin. Does not wait for
    /// any response from the child.
    pub async fn send(&self, task_id: &str, message: &str) -> Result<(), TaskError> {
        let record = self
            .registry
            .lookup(task_id)
            .ok_or_else(|| TaskError::not_found(task_id))?;

        if record.task.lock().unwrap().state != TaskState::Running {
            return Err(TaskError::not_running(task_id));
        }

        let executor = record.executor.lock().unwrap().clone();
        let Some(executor) = executor else {
            return Err(TaskError::child_gone(task_id));
        };

        let mut bytes = message.as_bytes().to_vec();
        bytes.push(b'\r');

        let _guard = record.write_lock.lock().await;
        executor.write(&bytes)
    }

    /// Snapshot of one task, or all tasks if `task_id` is `None`.
    pub fn status(&self, task_id: Option<&str>) -> Result<StatusResult, TaskError> {
        match task_id {
            Some(id) => {
                let record = self.registry.lookup(id).ok_or_else(|| TaskError::not_found(id))?;
                Ok(StatusResult::One(record.snapshot()))
            }
            None => Ok(StatusResult::All(self.registry.list())),
        }
    }

    /// Returns the accumulated output, optionally only the last `tail`
    /// bytes. Valid in any task state including terminal.
    pub fn output(&self, task_id: &str, opts: OutputOpts) -> Result<OutputResult, TaskError> {
        let record = self
            .registry
            .lookup(task_id)
            .ok_or_else(|| TaskError::not_found(task_id))?;

        let (bytes, truncated) = match opts.tail {
            Some(tail) => record.output_log.tail(tail),
            None => (record.output_log.snapshot(), false),
        };

        Ok(OutputResult {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            truncated,
        })
    }

    /// Sends SIGINT (or SIGINT-then-SIGKILL if `force`) to the child.
    /// The eventual `interrupted` transition is emitted by the
    /// executor's wait path, not synchronously by this call.
    pub async fn interrupt(&self, task_id: &str, opts: InterruptOpts) -> Result<(), TaskError> {
        let record = self
            .registry
            .lookup(task_id)
            .ok_or_else(|| TaskError::not_found(task_id))?;

        if record.task.lock().unwrap().state != TaskState::Running {
            return Err(TaskError::not_running(task_id));
        }

        let executor = record.executor.lock().unwrap().clone();
        let Some(executor) = executor else {
            return Err(TaskError::not_running(task_id));
        };

        record.interrupted.store(true, Ordering::Release);

        if opts.force {
            tokio::spawn(async move {
                executor.force_interrupt(Duration::from_secs(2)).await;
            });
        } else {
            #[cfg(unix)]
            executor.signal(libc::SIGINT);
            #[cfg(not(unix))]
            executor.signal(0);
        }

        Ok(())
    }

    /// Issues `interrupt(force=true)` to every running task, used by the
    /// supervisor's shutdown path.
    pub async fn interrupt_all(&self) {
        for (task_id, _) in self.registry.running_tasks() {
            let _ = self.interrupt(&task_id, InterruptOpts { force: true }).await;
        }
    }

    pub fn running_task_count(&self) -> usize {
        self.registry.running_tasks().len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusResult {
    One(Task),
    All(Vec<Task>),
}

/// Awaits the executor's exit, releases the handle, and publishes the
/// terminal `state-change` — in that order, so the executor handle is
/// always released before the event fires.
async fn watch_exit(record: Arc<TaskRecord>, bus: Arc<Bus>, task_id: String) {
    let executor = {
        let guard = record.executor.lock().unwrap();
        guard.clone()
    };
    let Some(executor) = executor else { return };
    let exit_reason = executor.wait().await;

    record.executor.lock().unwrap().take();

    let interrupted = record.interrupted.load(Ordering::Acquire);
    let (new_state, exit_code, reason) = match exit_reason {
        ExitReason::Exited(code) if interrupted => (TaskState::Interrupted, Some(code), None),
        ExitReason::Exited(0) => (TaskState::Completed, Some(0), None),
        ExitReason::Exited(code) => (TaskState::Failed, Some(code), None),
        ExitReason::BackpressureTimeout => {
            (TaskState::Failed, None, Some("backpressure_timeout".to_string()))
        }
        ExitReason::IoError => (TaskState::Failed, None, Some("io_error".to_string())),
    };

    let old = {
        let mut task = record.task.lock().unwrap();
        let old = task.state;
        task.mark_terminal(new_state, exit_code, reason.clone());
        old
    };

    log::info!("task {task_id}: {old:?} -> {new_state:?} (exit_code={exit_code:?})");
    bus.publish(Event::StateChange {
        task_id,
        old,
        new: new_state,
        ts: Utc::now(),
        exit_code,
        reason,
    });
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn _router_is_send_sync() {
    _assert_send_sync::<Router>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.child.command = "/bin/sh".to_string();
        config.child.args = vec!["-c".to_string(), "cat".to_string()];
        Arc::new(config)
    }

    #[tokio::test]
    async fn spawn_rejects_empty_prompt() {
        let router = Router::new(test_config());
        let err = router.spawn("   ".to_string(), SpawnOpts::default()).unwrap_err();
        assert_eq!(err.code, crate::core::error::RpcErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn spawn_returns_running_without_waiting_for_exit() {
        let router = Router::new(test_config());
        let result = router.spawn("hello".to_string(), SpawnOpts::default()).unwrap();
        assert_eq!(result.state, TaskState::Running);

        let status = router.status(Some(&result.task_id)).unwrap();
        match status {
            StatusResult::One(task) => assert_eq!(task.state, TaskState::Running),
            StatusResult::All(_) => panic!("expected single task"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_task_is_not_found() {
        let router = Router::new(test_config());
        let err = router.send("nope", "hi").await.unwrap_err();
        assert_eq!(err.code, crate::core::error::RpcErrorCode::NotFound);
    }

    #[tokio::test]
    async fn status_without_id_lists_everything() {
        let router = Router::new(test_config());
        router.spawn("a".to_string(), SpawnOpts::default()).unwrap();
        router.spawn("b".to_string(), SpawnOpts::default()).unwrap();
        match router.status(None).unwrap() {
            StatusResult::All(tasks) => assert_eq!(tasks.len(), 2),
            StatusResult::One(_) => panic!("expected all tasks"),
        }
    }

    #[tokio::test]
    async fn spawn_exec_failure_is_synchronous() {
        let mut config = Config::default();
        config.child.command = "/nonexistent/binary/path".to_string();
        let router = Router::new(Arc::new(config));
        let err = router.spawn("hello".to_string(), SpawnOpts::default()).unwrap_err();
        assert_eq!(err.code, crate::core::error::RpcErrorCode::ExecFailure);
    }

    #[tokio::test]
    async fn completed_task_yields_output_after_send() {
        let mut config = Config::default();
        config.child.command = "/bin/sh".to_string();
        config.child.args = vec!["-c".to_string(), "read line; echo \"got=$line\"".to_string()];
        let router = Router::new(Arc::new(config));
        let result = router.spawn("hello".to_string(), SpawnOpts::default()).unwrap();
        router.send(&result.task_id, "world").await.unwrap();

        tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                let status = router.status(Some(&result.task_id)).unwrap();
                if let StatusResult::One(task) = status {
                    if task.state.is_terminal() {
                        break;
                    }
                }
                tokio::time::sleep(StdDuration::from_millis(20)).await;
            }
        })
        .await
        .expect("task should terminate");

        let output = router.output(&result.task_id, OutputOpts::default()).unwrap();
        assert!(output.text.contains("got=world"));
    }
}
