//! Project dev-servers.
//!
//! At most one dev-server per project directory, shared by every watcher.
//! Unlike shells and assistant runs, a dev-server outlives the connection
//! that started it; watchers come and go through a per-project broadcast
//! group that survives restarts. The port is discovered by pattern
//! matching on log output, with a timeout fallback to `running` without
//! a URL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use bosun_common::{LogStream, ServerEnvelope, StatusInfo};
use bosun_process::{
    ManagedProcess, OutputStream, PortLineDetector, ProcessEvent, ReadinessDetector, SpawnSpec,
};

use crate::project::ProjectStore;
use crate::SessionError;

const GROUP_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DevServerConfig {
    /// Launcher binary.
    pub command: String,
    /// Arguments placed before the script name.
    pub run_args: Vec<String>,
    pub grace_period: Duration,
    /// How long to wait for a port before reporting `running` without one.
    pub readiness_timeout: Duration,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            run_args: vec!["run".to_string()],
            grace_period: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub success: bool,
    pub error: Option<String>,
    pub status: StatusInfo,
}

/// Outcome of a stop request.
#[derive(Debug, Clone)]
pub struct StopResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone)]
struct DevServer {
    process: Arc<ManagedProcess>,
    script: String,
    status: Arc<std::sync::RwLock<StatusInfo>>,
    stop_requested: Arc<AtomicBool>,
}

impl DevServer {
    fn snapshot(&self) -> StatusInfo {
        self.status.read().expect("status lock").clone()
    }
}

/// Dev-server registry, keyed by project directory. Cheap to clone.
#[derive(Clone)]
pub struct DevServerManager {
    config: Arc<DevServerConfig>,
    projects: Arc<dyn ProjectStore>,
    servers: Arc<RwLock<HashMap<PathBuf, DevServer>>>,
    // Broadcast groups outlive individual server processes so watchers
    // keep receiving across restarts.
    groups: Arc<RwLock<HashMap<PathBuf, broadcast::Sender<ServerEnvelope>>>>,
}

impl DevServerManager {
    pub fn new(config: DevServerConfig, projects: Arc<dyn ProjectStore>) -> Self {
        Self {
            config: Arc::new(config),
            projects,
            servers: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the named script for a project. Idempotent: a start for a
    /// project whose server is already live succeeds and reports the
    /// current status without spawning anything.
    pub async fn start(&self, project: &str, script: &str) -> Result<StartResult, SessionError> {
        let dir = self.projects.resolve_working_dir(project).await?;
        let scripts = self.projects.list_scripts(&dir).await?;
        if !scripts.iter().any(|s| s == script) {
            // A bad script name is a client mistake, not a server fault.
            return Ok(StartResult {
                success: false,
                error: Some(SessionError::ScriptNotFound.to_string()),
                status: StatusInfo::state("stopped"),
            });
        }

        // Check-and-insert under one write lock so two concurrent starts
        // for the same project cannot both spawn.
        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.get(&dir) {
            if existing.process.is_live() {
                tracing::debug!(project = %dir.display(), "dev server already running");
                return Ok(StartResult {
                    success: true,
                    error: None,
                    status: existing.snapshot(),
                });
            }
            // Dead entry (crashed earlier); a fresh start replaces it.
            servers.remove(&dir);
        }

        let spec = SpawnSpec::new(&self.config.command)
            .args(self.config.run_args.iter().cloned())
            .arg(script)
            .cwd(&dir)
            .grace_period(self.config.grace_period);
        let process = match ManagedProcess::spawn(spec) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(project = %dir.display(), error = %e, "dev server spawn failed");
                return Ok(StartResult {
                    success: false,
                    error: Some(e.to_string()),
                    status: StatusInfo::state("error"),
                });
            }
        };

        let server = DevServer {
            process,
            script: script.to_string(),
            status: Arc::new(std::sync::RwLock::new(StatusInfo::state("starting"))),
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        servers.insert(dir.clone(), server.clone());
        drop(servers);

        tracing::info!(
            project = %dir.display(),
            script = %script,
            pid = ?server.process.pid(),
            "dev server starting"
        );

        let group = self.group(&dir).await;
        let _ = group.send(ServerEnvelope::Status(server.snapshot()));

        let manager = self.clone();
        let pump_dir = dir;
        let pump_server = server.clone();
        tokio::spawn(async move {
            manager.pump(pump_dir, pump_server, group).await;
        });

        Ok(StartResult {
            success: true,
            error: None,
            status: server.snapshot(),
        })
    }

    /// Stop a project's dev-server: graceful first, forced after the
    /// grace period. A live server is terminated and its entry removed
    /// when the exit is observed; a crashed entry retained for status
    /// queries is cleared here.
    pub async fn stop(&self, project: &str) -> Result<StopResult, SessionError> {
        let dir = self.projects.resolve_working_dir(project).await?;
        let server = match self.servers.read().await.get(&dir).cloned() {
            Some(server) => server,
            None => {
                return Ok(StopResult {
                    success: false,
                    error: Some("no running server for project".to_string()),
                });
            }
        };
        if server.process.is_live() {
            server.stop_requested.store(true, Ordering::SeqCst);
            tracing::info!(project = %dir.display(), "stopping dev server");
            server.process.terminate(true).await?;
        } else {
            // Crashed earlier; an explicit stop clears the retained entry.
            tracing::info!(project = %dir.display(), "clearing crashed dev server entry");
            let _ = self
                .group(&dir)
                .await
                .send(ServerEnvelope::Status(StatusInfo::state("stopped")));
            self.remove_if_same(&dir, &server).await;
        }
        Ok(StopResult {
            success: true,
            error: None,
        })
    }

    /// Current status snapshot, or `None` when the project has no entry
    /// (never started, or stopped cleanly).
    pub async fn status(&self, project: &str) -> Result<Option<StatusInfo>, SessionError> {
        let dir = self.projects.resolve_working_dir(project).await?;
        Ok(self.servers.read().await.get(&dir).map(|s| s.snapshot()))
    }

    /// Script name a project's current entry was started with.
    pub async fn script(&self, project: &str) -> Result<Option<String>, SessionError> {
        let dir = self.projects.resolve_working_dir(project).await?;
        Ok(self
            .servers
            .read()
            .await
            .get(&dir)
            .map(|s| s.script.clone()))
    }

    /// Join a project's broadcast group. Valid before any server exists;
    /// the receiver stays attached across restarts.
    pub async fn subscribe(
        &self,
        project: &str,
    ) -> Result<broadcast::Receiver<ServerEnvelope>, SessionError> {
        let dir = self.projects.resolve_working_dir(project).await?;
        Ok(self.group(&dir).await.subscribe())
    }

    /// Remove a project's entry only if it still refers to this server's
    /// process. A restart may already have installed a replacement, which
    /// must not be evicted by the old server's teardown.
    async fn remove_if_same(&self, dir: &PathBuf, server: &DevServer) {
        let mut servers = self.servers.write().await;
        if let Some(current) = servers.get(dir) {
            if Arc::ptr_eq(&current.process, &server.process) {
                servers.remove(dir);
            }
        }
    }

    async fn group(&self, dir: &PathBuf) -> broadcast::Sender<ServerEnvelope> {
        let mut groups = self.groups.write().await;
        groups
            .entry(dir.clone())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .clone()
    }

    /// Relay one server's lifetime into its broadcast group: log lines,
    /// the port-discovery status flip, and the terminal status.
    async fn pump(
        &self,
        dir: PathBuf,
        server: DevServer,
        group: broadcast::Sender<ServerEnvelope>,
    ) {
        let detector = PortLineDetector::new();
        let mut rx = server.process.subscribe();
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;
        let mut ready = false;

        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = tokio::time::sleep_until(deadline), if !ready => {
                    // No port observed in time; report running anyway.
                    ready = true;
                    let status = {
                        let mut status = server.status.write().expect("status lock");
                        status.state = "running".to_string();
                        status.clone()
                    };
                    tracing::warn!(project = %dir.display(), "no port detected before timeout");
                    let _ = group.send(ServerEnvelope::Status(status));
                    continue;
                }
            };
            match event {
                Ok(ProcessEvent::Output { stream, data }) => {
                    if !ready {
                        if let Some(port) = detector.detect(&data) {
                            ready = true;
                            let status = {
                                let mut status = server.status.write().expect("status lock");
                                status.state = "running".to_string();
                                status.url = Some(format!("http://localhost:{port}"));
                                status.clone()
                            };
                            tracing::info!(project = %dir.display(), port, "dev server ready");
                            let _ = group.send(ServerEnvelope::Status(status));
                        }
                    }
                    let _ = group.send(ServerEnvelope::Log {
                        stream: log_stream(stream),
                        data,
                    });
                }
                Ok(ProcessEvent::Exit { code, signal }) => {
                    let requested = server.stop_requested.load(Ordering::SeqCst);
                    let clean = code == Some(0);
                    if requested || clean {
                        // Gone on purpose (or finished cleanly). Broadcast
                        // first, then drop the bookkeeping, but only our own:
                        // a restart may already have replaced the entry.
                        let _ = group.send(ServerEnvelope::Status(StatusInfo::state("stopped")));
                        self.remove_if_same(&dir, &server).await;
                        tracing::info!(project = %dir.display(), code = ?code, "dev server stopped");
                    } else {
                        // Crashed. Keep the entry so status queries report
                        // the failure until the next start replaces it.
                        let status = {
                            let mut status = server.status.write().expect("status lock");
                            status.state = "error".to_string();
                            status.url = None;
                            status.clone()
                        };
                        let _ = group.send(ServerEnvelope::Status(status));
                        let _ = group.send(ServerEnvelope::Error {
                            error: format!(
                                "dev server exited unexpectedly (code {:?}, signal {:?})",
                                code, signal
                            ),
                        });
                        tracing::error!(
                            project = %dir.display(),
                            code = ?code,
                            signal = ?signal,
                            "dev server crashed"
                        );
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(project = %dir.display(), skipped = n, "dev server log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn log_stream(stream: OutputStream) -> LogStream {
    match stream {
        OutputStream::Stdout => LogStream::Stdout,
        OutputStream::Stderr => LogStream::Stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::PackageManifestStore;

    /// A manager whose "launcher" is `sh -c <body>`; the trailing script
    /// name lands in `$0` and is ignored by the body.
    fn manager_for(root: &std::path::Path, body: &str) -> DevServerManager {
        DevServerManager::new(
            DevServerConfig {
                command: "sh".into(),
                run_args: vec!["-c".into(), body.into()],
                grace_period: Duration::from_secs(2),
                readiness_timeout: Duration::from_secs(5),
            },
            Arc::new(PackageManifestStore::new(root)),
        )
    }

    fn project_with_dev_script(dir: &std::path::Path) {
        std::fs::create_dir(dir.join("app")).unwrap();
        std::fs::write(
            dir.join("app/package.json"),
            r#"{"name":"app","scripts":{"dev":"vite"}}"#,
        )
        .unwrap();
    }

    async fn recv_within(rx: &mut broadcast::Receiver<ServerEnvelope>) -> ServerEnvelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("envelope before deadline")
            .expect("group open")
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn unknown_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");
        let result = manager.start("app", "storybook").await.expect("start");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("script not found"));
        assert!(manager.status("app").await.unwrap().is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn start_is_idempotent_while_live() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");

        let first = manager.start("app", "dev").await.expect("start");
        assert!(first.success);
        let first_pid = {
            let servers = manager.servers.read().await;
            servers.values().next().unwrap().process.pid()
        };

        let second = manager.start("app", "dev").await.expect("restart");
        assert!(second.success);
        let second_pid = {
            let servers = manager.servers.read().await;
            assert_eq!(servers.len(), 1);
            servers.values().next().unwrap().process.pid()
        };
        assert_eq!(first_pid, second_pid);

        manager.stop("app").await.expect("stop");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn port_discovery_flips_status_to_running() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(
            dir.path(),
            "echo '  Local:   http://localhost:5173/'; exec sleep 30",
        );

        let mut rx = manager.subscribe("app").await.expect("subscribe");
        let result = manager.start("app", "dev").await.expect("start");
        assert_eq!(result.status.state, "starting");

        let mut saw_running_url = false;
        let mut saw_log = false;
        for _ in 0..4 {
            match recv_within(&mut rx).await {
                ServerEnvelope::Status(StatusInfo {
                    state,
                    url: Some(url),
                    ..
                }) if state == "running" => {
                    assert_eq!(url, "http://localhost:5173");
                    saw_running_url = true;
                }
                ServerEnvelope::Status(_) => {}
                ServerEnvelope::Log {
                    stream: LogStream::Stdout,
                    data,
                } => {
                    assert!(data.contains("localhost:5173"));
                    saw_log = true;
                }
                other => panic!("unexpected envelope: {other:?}"),
            }
            if saw_running_url && saw_log {
                break;
            }
        }
        assert!(saw_running_url && saw_log);

        let status = manager.status("app").await.expect("status").expect("entry");
        assert_eq!(status.state, "running");
        assert_eq!(status.url.as_deref(), Some("http://localhost:5173"));

        manager.stop("app").await.expect("stop");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn crash_is_reported_and_entry_retained() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "echo booting; exit 3");

        let mut rx = manager.subscribe("app").await.expect("subscribe");
        manager.start("app", "dev").await.expect("start");

        loop {
            match recv_within(&mut rx).await {
                ServerEnvelope::Error { error } => {
                    assert!(error.contains("unexpectedly"));
                    break;
                }
                ServerEnvelope::Status(_) | ServerEnvelope::Log { .. } => continue,
                other => panic!("unexpected envelope: {other:?}"),
            }
        }

        // The failed entry sticks around for status queries.
        let status = manager.status("app").await.expect("status").expect("entry");
        assert_eq!(status.state, "error");

        // And a fresh start replaces it.
        let restarted = manager.start("app", "dev").await.expect("restart");
        assert!(restarted.success);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_broadcasts_stopped_and_forgets_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");

        let mut rx = manager.subscribe("app").await.expect("subscribe");
        manager.start("app", "dev").await.expect("start");

        let stop = manager.stop("app").await.expect("stop");
        assert!(stop.success);

        loop {
            match recv_within(&mut rx).await {
                ServerEnvelope::Status(StatusInfo { state, .. }) if state == "stopped" => break,
                ServerEnvelope::Status(_) | ServerEnvelope::Log { .. } => continue,
                other => panic!("unexpected envelope: {other:?}"),
            }
        }
        // Wait for the pump to finish its bookkeeping.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if manager.status("app").await.expect("status").is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "entry not removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn restart_after_stop_stays_registered() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");

        manager.start("app", "dev").await.expect("start");
        manager.stop("app").await.expect("stop");
        // Restart immediately, before the old pump has finished its
        // teardown bookkeeping.
        let restarted = manager.start("app", "dev").await.expect("restart");
        assert!(restarted.success);

        // The old pump must not evict the replacement.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = manager.status("app").await.expect("status");
        assert!(status.is_some(), "replacement server lost from registry");
        assert_eq!(manager.servers.read().await.len(), 1);

        manager.stop("app").await.expect("cleanup");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn concurrent_starts_spawn_one_server() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");

        let (a, b) = tokio::join!(manager.start("app", "dev"), manager.start("app", "dev"));
        assert!(a.expect("first start").success);
        assert!(b.expect("second start").success);

        let servers = manager.servers.read().await;
        assert_eq!(servers.len(), 1);
        drop(servers);

        manager.stop("app").await.expect("cleanup");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_clears_a_crashed_entry() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exit 3");

        let mut rx = manager.subscribe("app").await.expect("subscribe");
        manager.start("app", "dev").await.expect("start");

        // Wait for the crash to be recorded.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match manager.status("app").await.expect("status") {
                Some(status) if status.state == "error" => break,
                _ => {
                    assert!(tokio::time::Instant::now() < deadline, "crash not recorded");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }

        let stop = manager.stop("app").await.expect("stop");
        assert!(stop.success);
        assert!(manager.status("app").await.expect("status").is_none());

        // The explicit clear is announced to watchers.
        loop {
            match recv_within(&mut rx).await {
                ServerEnvelope::Status(StatusInfo { state, .. }) if state == "stopped" => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_without_a_server_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        project_with_dev_script(dir.path());
        let manager = manager_for(dir.path(), "exec sleep 30");
        let stop = manager.stop("app").await.expect("stop");
        assert!(!stop.success);
        assert!(stop.error.is_some());
    }
}
