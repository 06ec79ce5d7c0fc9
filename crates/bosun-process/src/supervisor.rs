//! Spawn, monitor, and terminate child processes.
//!
//! [`ManagedProcess::spawn`] covers both backends: piped children via
//! `tokio::process` (line-oriented stdout/stderr) and PTY-backed children
//! via `portable-pty` (raw merged chunks). One reader task per process
//! drains output into the broadcast event stream and reaps the child, so
//! the terminal [`ProcessEvent::Exit`] is always ordered after the last
//! output chunk.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex};

use crate::event::{OutputStream, ProcessEvent};
use crate::state::ProcessState;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PTY_READ_BUFFER: usize = 8192;

/// Errors originating from process supervision.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("process is not writable in state {0}")]
    NotWritable(ProcessState),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to resize pty: {0}")]
    ResizeFailed(String),

    #[error("resize is only supported for pty-backed processes")]
    NotAPty,

    #[error("failed to signal process: {0}")]
    SignalFailed(String),
}

/// Initial PTY geometry.
#[derive(Debug, Clone, Copy)]
pub struct PtyGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyGeometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Everything needed to start a child process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Spawn inside a pseudo-terminal with this geometry.
    pub pty: Option<PtyGeometry>,
    /// How long a graceful terminate waits before escalating.
    pub grace_period: Duration,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            pty: None,
            grace_period: Duration::from_secs(5),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn pty(mut self, geometry: PtyGeometry) -> Self {
        self.pty = Some(geometry);
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

enum ProcessWriter {
    Pty(Box<dyn Write + Send>),
    Piped(ChildStdin),
    Detached,
}

/// One supervised child process.
///
/// Cheap to share: managers hold it in an `Arc`, reader tasks hold only
/// channel clones, so dropping the last `Arc` never tears down a live
/// process behind a manager's back — teardown is always explicit via
/// [`terminate`](Self::terminate).
pub struct ManagedProcess {
    command: String,
    pid: Option<u32>,
    grace_period: Duration,
    state: Arc<watch::Sender<ProcessState>>,
    events: broadcast::Sender<ProcessEvent>,
    writer: Mutex<ProcessWriter>,
    pty_master: Option<std::sync::Mutex<Box<dyn MasterPty + Send>>>,
    // Receiver created before the reader task starts, so the first
    // subscriber misses nothing produced between spawn and subscribe.
    first_rx: std::sync::Mutex<Option<broadcast::Receiver<ProcessEvent>>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl ManagedProcess {
    /// Spawn a child according to `spec`. Returns with the process in
    /// `running`; the OS-level spawn has succeeded, anything later is
    /// reported through the event stream.
    pub fn spawn(spec: SpawnSpec) -> Result<Arc<Self>, ProcessError> {
        match spec.pty {
            Some(geometry) => Self::spawn_pty(spec, geometry),
            None => Self::spawn_piped(spec),
        }
    }

    fn spawn_pty(spec: SpawnSpec, geometry: PtyGeometry) -> Result<Arc<Self>, ProcessError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: geometry.rows,
                cols: geometry.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", spec.command)))?;
        // The slave fd must be dropped in the parent or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let (state, events, first_rx) = Self::channels();
        transition(&state, ProcessState::Running);

        let task_state = state.clone();
        let task_events = events.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; PTY_READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let _ = task_events.send(ProcessEvent::Output {
                            stream: OutputStream::Stdout,
                            data,
                        });
                    }
                    // EIO is the normal end-of-pty condition on Linux.
                    Err(_) => break,
                }
            }
            let code = child.wait().ok().map(|status| status.exit_code() as i32);
            observe_exit(&task_state, &task_events, code, None);
        });

        Ok(Arc::new(Self {
            command: spec.command,
            pid,
            grace_period: spec.grace_period,
            state,
            events,
            writer: Mutex::new(ProcessWriter::Pty(writer)),
            pty_master: Some(std::sync::Mutex::new(pair.master)),
            first_rx: std::sync::Mutex::new(Some(first_rx)),
        }))
    }

    fn spawn_piped(spec: SpawnSpec) -> Result<Arc<Self>, ProcessError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(spec.env.iter().cloned());

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", spec.command)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stderr not captured".into()))?;

        let (state, events, first_rx) = Self::channels();
        transition(&state, ProcessState::Running);

        let task_state = state.clone();
        let task_events = events.clone();
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;
            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(data)) => {
                            let _ = task_events.send(ProcessEvent::Output {
                                stream: OutputStream::Stdout,
                                data,
                            });
                        }
                        _ => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(data)) => {
                            let _ = task_events.send(ProcessEvent::Output {
                                stream: OutputStream::Stderr,
                                data,
                            });
                        }
                        _ => err_done = true,
                    },
                }
            }
            let (code, signal) = match child.wait().await {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to reap child");
                    (None, None)
                }
            };
            observe_exit(&task_state, &task_events, code, signal);
        });

        let writer = match stdin {
            Some(stdin) => ProcessWriter::Piped(stdin),
            None => ProcessWriter::Detached,
        };

        Ok(Arc::new(Self {
            command: spec.command,
            pid,
            grace_period: spec.grace_period,
            state,
            events,
            writer: Mutex::new(writer),
            pty_master: None,
            first_rx: std::sync::Mutex::new(Some(first_rx)),
        }))
    }

    fn channels() -> (
        Arc<watch::Sender<ProcessState>>,
        broadcast::Sender<ProcessEvent>,
        broadcast::Receiver<ProcessEvent>,
    ) {
        let (state, _) = watch::channel(ProcessState::Starting);
        let (events, first_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Arc::new(state), events, first_rx)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Attach a listener to the event stream. The first subscriber sees
    /// every event from spawn onward; later subscribers only receive
    /// events produced after attachment (no backlog replay).
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        if let Ok(mut guard) = self.first_rx.lock() {
            if let Some(rx) = guard.take() {
                return rx;
            }
        }
        self.events.subscribe()
    }

    /// Write bytes to the process's input. Fails unless the process is
    /// `running`.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        let state = self.state();
        if state != ProcessState::Running {
            return Err(ProcessError::NotWritable(state));
        }
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            ProcessWriter::Pty(w) => {
                w.write_all(data)?;
                w.flush()?;
            }
            ProcessWriter::Piped(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await?;
            }
            ProcessWriter::Detached => return Err(ProcessError::NotWritable(state)),
        }
        Ok(())
    }

    /// Apply new PTY geometry. Errors for non-PTY processes.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ProcessError> {
        let master = self.pty_master.as_ref().ok_or(ProcessError::NotAPty)?;
        let master = master
            .lock()
            .map_err(|_| ProcessError::ResizeFailed("pty lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::ResizeFailed(e.to_string()))
    }

    /// Move the process to `stopping` and take it down. With `graceful`,
    /// sends SIGTERM first and escalates to a forced kill if the process
    /// has not exited within the grace period. No-op on an already
    /// terminal process.
    pub async fn terminate(&self, graceful: bool) -> Result<(), ProcessError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        transition(&self.state, ProcessState::Stopping);

        if graceful {
            if let Err(e) = self.signal(Signal::Term).await {
                tracing::warn!(pid = ?self.pid, error = %e, "graceful signal failed");
            }
            if self.wait_terminal(self.grace_period).await {
                return Ok(());
            }
            tracing::warn!(
                pid = ?self.pid,
                command = %self.command,
                "process did not exit within grace period, escalating"
            );
        }

        self.signal(Signal::Kill).await
    }

    /// Wait until the process reaches a terminal state.
    pub async fn wait_exit(&self) -> ProcessState {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    async fn wait_terminal(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_exit()).await.is_ok()
    }

    async fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let pid = self
            .pid
            .ok_or_else(|| ProcessError::SignalFailed("process id unknown".into()))?;
        send_signal(pid, signal).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
async fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let flag = match signal {
        Signal::Term => "-TERM",
        Signal::Kill => "-KILL",
    };
    let status = Command::new("kill")
        .arg(flag)
        .arg(pid.to_string())
        .status()
        .await
        .map_err(|e| ProcessError::SignalFailed(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::SignalFailed(format!(
            "kill {flag} {pid} exited with {status}"
        )))
    }
}

#[cfg(not(unix))]
async fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if matches!(signal, Signal::Kill) {
        cmd.arg("/F");
    }
    let status = cmd
        .status()
        .await
        .map_err(|e| ProcessError::SignalFailed(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::SignalFailed(format!(
            "taskkill {pid} exited with {status}"
        )))
    }
}

fn transition(state: &watch::Sender<ProcessState>, next: ProcessState) -> bool {
    let mut changed = false;
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "process state transition");
            *current = next;
            changed = true;
            true
        } else {
            false
        }
    });
    changed
}

/// Record the observed exit in the state machine and emit the terminal
/// event. A clean exit (or one we asked for) lands in `stopped`; an
/// unrequested non-zero exit lands in `error`.
fn observe_exit(
    state: &watch::Sender<ProcessState>,
    events: &broadcast::Sender<ProcessEvent>,
    code: Option<i32>,
    signal: Option<String>,
) {
    let stopping = *state.borrow() == ProcessState::Stopping;
    if stopping || code == Some(0) {
        transition(state, ProcessState::Stopping);
        transition(state, ProcessState::Stopped);
    } else {
        transition(state, ProcessState::Error);
    }
    let _ = events.send(ProcessEvent::Exit { code, signal });
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|n| match n {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_until_exit(
        mut rx: broadcast::Receiver<ProcessEvent>,
    ) -> (Vec<(OutputStream, String)>, Option<i32>, Option<String>) {
        let mut chunks = Vec::new();
        loop {
            match rx.recv().await {
                Ok(ProcessEvent::Output { stream, data }) => chunks.push((stream, data)),
                Ok(ProcessEvent::Exit { code, signal }) => return (chunks, code, signal),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return (chunks, None, None),
            }
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn piped_output_preserves_order() {
        let spec = SpawnSpec::new("sh").args(["-c", "echo a; echo b; echo c"]);
        let process = ManagedProcess::spawn(spec).expect("spawn sh");
        let rx = process.subscribe();
        let (chunks, code, _) = collect_until_exit(rx).await;

        let stdout: Vec<&str> = chunks
            .iter()
            .filter(|(stream, _)| *stream == OutputStream::Stdout)
            .map(|(_, data)| data.as_str())
            .collect();
        assert_eq!(stdout, vec!["a", "b", "c"]);
        assert_eq!(code, Some(0));
        assert_eq!(process.wait_exit().await, ProcessState::Stopped);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stderr_is_tagged() {
        let spec = SpawnSpec::new("sh").args(["-c", "echo oops >&2"]);
        let process = ManagedProcess::spawn(spec).expect("spawn sh");
        let (chunks, code, _) = collect_until_exit(process.subscribe()).await;
        assert_eq!(code, Some(0));
        assert!(chunks
            .iter()
            .any(|(stream, data)| *stream == OutputStream::Stderr && data == "oops"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn unrequested_nonzero_exit_is_error() {
        let spec = SpawnSpec::new("sh").args(["-c", "exit 3"]);
        let process = ManagedProcess::spawn(spec).expect("spawn sh");
        let (_, code, _) = collect_until_exit(process.subscribe()).await;
        assert_eq!(code, Some(3));
        assert_eq!(process.wait_exit().await, ProcessState::Error);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn write_after_exit_is_rejected() {
        let spec = SpawnSpec::new("true");
        let process = ManagedProcess::spawn(spec).expect("spawn true");
        process.wait_exit().await;
        let err = process.write(b"hello\n").await.unwrap_err();
        assert!(matches!(err, ProcessError::NotWritable(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn terminate_is_idempotent() {
        let spec = SpawnSpec::new("sleep")
            .arg("30")
            .grace_period(Duration::from_secs(2));
        let process = ManagedProcess::spawn(spec).expect("spawn sleep");
        process.terminate(true).await.expect("first terminate");
        process.wait_exit().await;
        assert!(process.state().is_terminal());
        // Second terminate on a dead process is a no-op.
        process.terminate(true).await.expect("second terminate");
        process.terminate(false).await.expect("forced terminate");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn requested_termination_lands_in_stopped() {
        let spec = SpawnSpec::new("sleep")
            .arg("30")
            .grace_period(Duration::from_secs(2));
        let process = ManagedProcess::spawn(spec).expect("spawn sleep");
        process.terminate(true).await.expect("terminate");
        assert_eq!(process.wait_exit().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let spec = SpawnSpec::new("/nonexistent/definitely-not-a-binary");
        let err = ManagedProcess::spawn(spec).unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn pty_shell_round_trip() {
        let spec = SpawnSpec::new("/bin/sh").pty(PtyGeometry::default());
        let process = ManagedProcess::spawn(spec).expect("spawn sh in pty");
        let rx = process.subscribe();

        process.write(b"echo hello\n").await.expect("write");
        process.write(b"exit\n").await.expect("write exit");

        let (chunks, _, _) = collect_until_exit(rx).await;
        let output: String = chunks.into_iter().map(|(_, data)| data).collect();
        assert!(output.contains("hello"), "expected 'hello' in {output:?}");
        assert_eq!(process.wait_exit().await, ProcessState::Stopped);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn resize_requires_a_pty() {
        let spec = SpawnSpec::new("sleep").arg("5");
        let process = ManagedProcess::spawn(spec).expect("spawn sleep");
        assert!(matches!(
            process.resize(120, 40),
            Err(ProcessError::NotAPty)
        ));
        process.terminate(false).await.expect("kill");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn pty_resize_succeeds() {
        let spec = SpawnSpec::new("/bin/sh").pty(PtyGeometry { cols: 80, rows: 24 });
        let process = ManagedProcess::spawn(spec).expect("spawn sh in pty");
        process.resize(132, 43).expect("resize");
        process.terminate(false).await.expect("kill");
        process.wait_exit().await;
    }
}
