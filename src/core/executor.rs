//! PTY executor (component A).
//!
//! Launches the supervised child inside a pseudo-terminal. A PTY is used
//! instead of plain pipes because the child behaves differently off a
//! TTY (line-buffered or refusing to start) and because a PTY gives us a
//! canonical channel for keystroke injection, including control
//! characters such as `\x03` (Ctrl-C) and `\x1b` (ESC), which this
//! executor never interprets or translates.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot, Notify};

#[cfg(unix)]
use libc;

use crate::core::error::TaskError;

/// Pushes `data` onto `tx` with blocking retries, polling on a 10ms
/// interval so a full channel can be detected as backpressure rather
/// than blocking the reader thread forever. Returns `false` once the
/// receiver is gone or the timeout is exceeded (in the latter case,
/// `backpressured` is set first so the consumer can tell the two apart).
fn send_with_backpressure_guard(
    tx: &mpsc::Sender<Vec<u8>>,
    mut data: Vec<u8>,
    timeout: Duration,
    backpressured: &AtomicBool,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match tx.try_send(data) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(returned)) => {
                if std::time::Instant::now() >= deadline {
                    backpressured.store(true, Ordering::Release);
                    return false;
                }
                data = returned;
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Stateful UTF-8 decoder that buffers a trailing incomplete multi-byte
/// sequence across PTY read chunks, so a box-drawing character or emoji
/// split at a 4096-byte read boundary never becomes a `U+FFFD` artifact
/// purely from chunking.
pub(crate) struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::find_valid_boundary(&data);
        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }
        data.truncate(valid_up_to);
        data
    }

    fn find_valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    valid
                } else {
                    valid + e.error_len().unwrap_or(1)
                }
            }
        }
    }
}

/// Why the executor reports the child as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    /// The reader-side queue stayed full past `backpressure_timeout`.
    BackpressureTimeout,
    /// An unrecoverable PTY I/O error.
    IoError,
}

/// A chunk of bytes read from the child, handed to whoever registered
/// `on_bytes` at launch.
pub type BytesCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

struct Inner {
    writer: Mutex<Box<dyn Write + Send>>,
    #[cfg(unix)]
    pgid: i32,
    #[cfg(not(unix))]
    child_pid: i32,
    shutdown: std::sync::Arc<Notify>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    alive: AtomicBool,
}

/// Owns one child process + PTY pair for the lifetime of a task. A
/// dedicated OS thread drains the PTY master into a bounded channel; a
/// tokio task forwards decoded chunks to the registered callback and
/// watches for backpressure/exit.
pub struct PtyExecutor {
    inner: std::sync::Arc<Inner>,
    exit_rx: Mutex<Option<oneshot::Receiver<ExitReason>>>,
}

impl PtyExecutor {
    /// Launches `command args... prompt` inside an 80x24 PTY.
    ///
    /// `on_bytes` is invoked once per chunk read from the PTY master
    /// (size bounded by the 4096-byte read buffer). Returns `ExecFailure`
    /// if the PTY cannot be allocated or the binary cannot be executed;
    /// once this returns `Ok`, a child exists and the reader is pumping.
    pub fn launch(
        command: &str,
        args: &[String],
        prompt: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        backpressure_timeout: Duration,
        on_bytes: BytesCallback,
    ) -> Result<Self, TaskError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TaskError::exec_failure(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(command);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.arg(prompt);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TaskError::exec_failure(format!("failed to spawn child: {e}")))?;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| TaskError::exec_failure("could not obtain child PID"))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TaskError::exec_failure(format!("failed to take PTY writer: {e}")))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TaskError::exec_failure(format!("failed to clone PTY reader: {e}")))?;

        let shutdown = std::sync::Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        // Bounded channel between the blocking reader thread and the
        // async forwarder. Sized generously so a momentarily slow
        // consumer doesn't immediately trip backpressure.
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
        // Set by the reader thread when it cannot enqueue a chunk for
        // longer than `backpressure_timeout`; distinguishes a
        // backpressure-induced channel close from a
        // plain EOF, both of which look like `rx.recv() -> None`.
        let backpressured = std::sync::Arc::new(AtomicBool::new(false));
        let backpressured_reader = backpressured.clone();

        let reader_handle = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break, // EOF
                        Ok(n) => {
                            if !send_with_backpressure_guard(
                                &tx,
                                buf[..n].to_vec(),
                                backpressure_timeout,
                                &backpressured_reader,
                            ) {
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("PTY reader error: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| TaskError::exec_failure(format!("failed to spawn reader thread: {e}")))?;

        let (exit_tx, exit_rx) = oneshot::channel();

        let inner = std::sync::Arc::new(Inner {
            writer: Mutex::new(writer),
            #[cfg(unix)]
            pgid,
            #[cfg(not(unix))]
            child_pid,
            shutdown,
            reader_handle: Mutex::new(Some(reader_handle)),
            alive: AtomicBool::new(true),
        });

        let inner_for_task = inner.clone();
        let mut child = child;
        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();

            loop {
                tokio::select! {
                    data = rx.recv() => {
                        match data {
                            Some(bytes) => {
                                let decoded = decoder.decode(&bytes);
                                if !decoded.is_empty() {
                                    on_bytes(&decoded);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_clone.notified() => break,
                }
            }

            let exit_reason = if backpressured.load(Ordering::Acquire) {
                ExitReason::BackpressureTimeout
            } else {
                match child.wait() {
                    Ok(status) => ExitReason::Exited(exit_code_of(status)),
                    Err(e) => {
                        log::debug!("child wait() failed: {e}");
                        ExitReason::IoError
                    }
                }
            };

            inner_for_task.alive.store(false, Ordering::Release);
            let _ = exit_tx.send(exit_reason);
        });

        drop(pair.slave);

        Ok(Self {
            inner,
            exit_rx: Mutex::new(Some(exit_rx)),
        })
    }

    /// Enqueues bytes to the child's stdin, retrying partial writes
    /// until all bytes are delivered or the child has died. Control
    /// characters are passed through untouched.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TaskError> {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(TaskError::child_gone("task"));
        }
        let mut writer = self
            .inner
            .writer
            .lock()
            .map_err(|_| TaskError::exec_failure("PTY writer lock poisoned"))?;
        writer.write_all(bytes).map_err(|e| self.write_error("write", e))?;
        writer.flush().map_err(|e| self.write_error("flush", e))?;
        Ok(())
    }

    /// Classifies an I/O error from a post-launch write/flush. If the
    /// child has since died, this is `ChildGone`, not `ExecFailure`: that
    /// code is reserved for launch-time failure, not a write syscall
    /// racing process exit.
    fn write_error(&self, op: &str, e: std::io::Error) -> TaskError {
        if !self.inner.alive.load(Ordering::Acquire) {
            TaskError::child_gone("task")
        } else {
            TaskError::exec_failure(format!("{op} failed: {e}"))
        }
    }

    /// Delivers a POSIX signal to the child's process group.
    #[cfg(unix)]
    pub fn signal(&self, sig: i32) {
        let result = unsafe { libc::kill(-self.inner.pgid, sig) };
        if result != 0 {
            log::warn!(
                "failed to deliver signal {sig} to pgid {}: {}",
                self.inner.pgid,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _sig: i32) {
        log::warn!("signal delivery is not supported on this platform");
    }

    /// Waits up to `force_after` for a graceful exit, then escalates to
    /// SIGKILL (Unix) — used by `interrupt(force=true)`.
    #[cfg(unix)]
    pub async fn force_interrupt(&self, force_after: Duration) {
        self.signal(libc::SIGINT);
        let deadline = tokio::time::Instant::now() + force_after;
        while self.inner.alive.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                self.signal(libc::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(not(unix))]
    pub async fn force_interrupt(&self, _force_after: Duration) {
        log::warn!("force interrupt is not supported on this platform");
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Resolves once the child has fully exited and the reader has
    /// drained EOF. Consumable exactly once.
    pub async fn wait(&self) -> ExitReason {
        let rx = self.exit_rx.lock().unwrap().take();
        match rx {
            Some(rx) => rx.await.unwrap_or(ExitReason::IoError),
            None => ExitReason::IoError,
        }
    }

    /// Tears down the reader thread and notifies any waiters. Called
    /// when the task reaches a terminal state so the executor handle is
    /// released before the `state-change` event fires.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
        let handle = self.inner.reader_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = std::thread::spawn(move || handle.join());
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: portable_pty::ExitStatus) -> i32 {
    status.exit_code() as i32
}

#[cfg(not(unix))]
fn exit_code_of(status: portable_pty::ExitStatus) -> i32 {
    status.exit_code() as i32
}
