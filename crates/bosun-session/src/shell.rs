//! Interactive shell sessions.
//!
//! Each session is a PTY-backed shell tied 1:1 to its connection: the
//! connection's lifetime bounds the session's. Input bytes go to the PTY
//! verbatim, PTY output comes back in arrival order, and closing the
//! connection tears the shell down. Bookkeeping is removed synchronously
//! with close; a lagging forceful kill is allowed to finish afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use bosun_process::{ManagedProcess, ProcessEvent, PtyGeometry, SpawnSpec};

use crate::SessionError;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell binary. Defaults to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    pub grace_period: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: None,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Shell session store. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ShellManager {
    config: Arc<ShellConfig>,
    sessions: Arc<RwLock<HashMap<String, Arc<ManagedProcess>>>>,
}

impl ShellManager {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a shell session. Generates a session id when the caller did
    /// not supply one. If a live process already exists for the supplied
    /// id (a reconnect), it is replaced: the old process is removed from
    /// bookkeeping immediately and terminated in the background.
    pub async fn open(
        &self,
        requested_id: Option<String>,
        cwd: Option<PathBuf>,
        geometry: PtyGeometry,
    ) -> Result<ShellSession, SessionError> {
        let (id, is_new) = match requested_id.filter(|id| !id.is_empty()) {
            Some(id) => (id, false),
            None => (bosun_common::new_id(), true),
        };

        let shell = self
            .config
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());

        let mut spec = SpawnSpec::new(&shell)
            .pty(geometry)
            .grace_period(self.config.grace_period)
            .env("TERM", "xterm-256color");
        if let Some(cwd) = cwd {
            spec = spec.cwd(cwd);
        }

        // Check-and-insert under one lock so two opens for the same id
        // cannot both spawn. Spawning is synchronous, so holding the
        // write guard across it is safe.
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.remove(&id) {
            if old.is_live() {
                tracing::info!(session = %id, "replacing live shell session");
                tokio::spawn(async move {
                    if let Err(e) = old.terminate(true).await {
                        tracing::warn!(error = %e, "failed to terminate replaced shell");
                    }
                });
            }
        }
        let process = ManagedProcess::spawn(spec)?;
        sessions.insert(id.clone(), process.clone());
        drop(sessions);

        tracing::info!(session = %id, shell = %shell, pid = ?process.pid(), "shell session opened");

        Ok(ShellSession {
            id,
            is_new,
            process,
            manager: self.clone(),
        })
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// One live shell, handed to the owning connection.
pub struct ShellSession {
    id: String,
    is_new: bool,
    process: Arc<ManagedProcess>,
    manager: ShellManager,
}

impl ShellSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the id was generated for this connection rather than
    /// supplied by the caller.
    pub fn is_new_session(&self) -> bool {
        self.is_new
    }

    /// PTY output and the terminal exit event, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.process.subscribe()
    }

    /// Write keystroke bytes verbatim to the PTY.
    pub async fn input(&self, data: &str) -> Result<(), SessionError> {
        self.process.write(data.as_bytes()).await?;
        Ok(())
    }

    /// Apply new PTY geometry. Failure is logged by the caller, not fatal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.process.resize(cols, rows)?;
        Ok(())
    }

    /// Close the session: bookkeeping goes away now, the process is
    /// terminated gracefully in the background. Removal only applies to
    /// this session's own process; a reconnect may already have replaced
    /// the registry entry, and the replacement must survive a late close.
    pub async fn close(self) {
        let mut sessions = self.manager.sessions.write().await;
        if let Some(current) = sessions.get(&self.id) {
            if Arc::ptr_eq(current, &self.process) {
                sessions.remove(&self.id);
            }
        }
        drop(sessions);
        let id = self.id;
        let process = self.process;
        tokio::spawn(async move {
            if let Err(e) = process.terminate(true).await {
                tracing::warn!(session = %id, error = %e, "shell teardown failed");
            } else {
                tracing::debug!(session = %id, "shell session closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_process::ProcessState;

    fn test_manager() -> ShellManager {
        ShellManager::new(ShellConfig {
            shell: Some("/bin/sh".into()),
            grace_period: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn generates_session_id_when_none_supplied() {
        let manager = test_manager();
        let session = manager
            .open(None, None, PtyGeometry::default())
            .await
            .expect("open");
        assert!(session.is_new_session());
        assert!(!session.id().is_empty());
        assert!(manager.contains(session.id()).await);
        session.close().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn keeps_caller_supplied_id() {
        let manager = test_manager();
        let session = manager
            .open(Some("resume-me".into()), None, PtyGeometry::default())
            .await
            .expect("open");
        assert!(!session.is_new_session());
        assert_eq!(session.id(), "resume-me");
        session.close().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn shell_round_trip_and_teardown() {
        let manager = test_manager();
        let session = manager
            .open(None, None, PtyGeometry::default())
            .await
            .expect("open");
        let mut rx = session.subscribe();

        session.input("echo marker-42\n").await.expect("input");

        let mut output = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !output.contains("marker-42") {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("shell output before deadline")
                .expect("stream open");
            if let ProcessEvent::Output { data, .. } = event {
                output.push_str(&data);
            }
        }

        let id = session.id().to_string();
        let process = session.process.clone();
        session.close().await;
        // Bookkeeping is gone synchronously with close.
        assert!(!manager.contains(&id).await);
        // The process itself is torn down within the grace period.
        assert_eq!(process.wait_exit().await, ProcessState::Stopped);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn reopen_replaces_live_session() {
        let manager = test_manager();
        let first = manager
            .open(Some("shared".into()), None, PtyGeometry::default())
            .await
            .expect("open");
        let first_process = first.process.clone();
        let second = manager
            .open(Some("shared".into()), None, PtyGeometry::default())
            .await
            .expect("reopen");
        assert_eq!(manager.count().await, 1);
        first_process.wait_exit().await;
        second.close().await;
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn late_close_of_replaced_session_keeps_replacement() {
        let manager = test_manager();
        let first = manager
            .open(Some("shared".into()), None, PtyGeometry::default())
            .await
            .expect("open");
        let second = manager
            .open(Some("shared".into()), None, PtyGeometry::default())
            .await
            .expect("reopen");

        // The old connection closes after being replaced; the
        // replacement's bookkeeping must survive.
        first.close().await;
        assert!(manager.contains("shared").await);
        assert_eq!(manager.count().await, 1);

        second.close().await;
        assert!(!manager.contains("shared").await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn resize_applies_to_pty() {
        let manager = test_manager();
        let session = manager
            .open(None, None, PtyGeometry::default())
            .await
            .expect("open");
        session.resize(132, 43).expect("resize");
        session.close().await;
    }
}
