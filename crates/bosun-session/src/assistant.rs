//! Assistant CLI sessions.
//!
//! Spawns one `claude` CLI process per run, translates its stream-json
//! stdout into envelopes, and supports mid-flight interruption. Session
//! continuity across runs lives in the CLI itself: resuming passes
//! `--resume <id>` to the spawned process, the manager never replays
//! history. Records are forwarded live first, then handed to the
//! session-history collaborator fire-and-forget.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use bosun_common::{ServerEnvelope, SpawnOptions, StatusInfo};
use bosun_process::{ManagedProcess, OutputStream, ProcessEvent, SpawnSpec};

use crate::history::SessionHistory;
use crate::project::ProjectStore;
use crate::SessionError;

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// CLI binary to spawn.
    pub binary: String,
    pub grace_period: Duration,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct AssistantRun {
    process: Arc<ManagedProcess>,
    interrupted: Arc<AtomicBool>,
}

/// Registry of live assistant runs. Cheap to clone.
///
/// Fresh runs are keyed under a locally generated provisional id until
/// the CLI reports its own session id in the init record; the reported
/// id is then aliased onto the same run so both keys resolve for
/// `interrupt`.
#[derive(Clone)]
pub struct AssistantManager {
    config: Arc<AssistantConfig>,
    projects: Arc<dyn ProjectStore>,
    history: Arc<dyn SessionHistory>,
    runs: Arc<RwLock<HashMap<String, AssistantRun>>>,
}

impl AssistantManager {
    pub fn new(
        config: AssistantConfig,
        projects: Arc<dyn ProjectStore>,
        history: Arc<dyn SessionHistory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            projects,
            history,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start (or resume) a run. Returns the registry key to use for
    /// `interrupt`: the resumed session id, or a provisional id for
    /// fresh runs. Envelopes flow to `tx`; any failure to start is
    /// reported there as a single `error` envelope as well as in the
    /// return, so callers never need to translate errors themselves.
    pub async fn start(
        &self,
        prompt: &str,
        options: SpawnOptions,
        tx: mpsc::Sender<ServerEnvelope>,
    ) -> Result<String, SessionError> {
        let result = self.start_inner(prompt, options, &tx).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "assistant start failed");
            let _ = tx
                .send(ServerEnvelope::Error {
                    error: e.to_string(),
                })
                .await;
        }
        result
    }

    async fn start_inner(
        &self,
        prompt: &str,
        options: SpawnOptions,
        tx: &mpsc::Sender<ServerEnvelope>,
    ) -> Result<String, SessionError> {
        let cwd = self.resolve_cwd(&options).await?;
        let resume_id = if options.resume {
            options.session_id.clone()
        } else {
            None
        };
        let key = resume_id.clone().unwrap_or_else(bosun_common::new_id);

        let spawn_result = {
            let mut runs = self.runs.write().await;
            if let Some(existing) = runs.get(&key) {
                if existing.process.is_live() {
                    return Err(SessionError::AlreadyRunning(key));
                }
            }
            let args = build_args(prompt, &options, resume_id.as_deref());
            let spec = SpawnSpec::new(&self.config.binary)
                .args(args)
                .cwd(&cwd)
                .grace_period(self.config.grace_period);
            match ManagedProcess::spawn(spec) {
                Ok(process) => {
                    let run = AssistantRun {
                        process,
                        interrupted: Arc::new(AtomicBool::new(false)),
                    };
                    runs.insert(key.clone(), run.clone());
                    Ok(run)
                }
                Err(e) => Err(e),
            }
        };

        let run = match spawn_result {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(error = %e, binary = %self.config.binary, "assistant spawn failed");
                return Err(e.into());
            }
        };

        tracing::info!(
            session = %key,
            cwd = %cwd.display(),
            resumed = resume_id.is_some(),
            pid = ?run.process.pid(),
            "assistant run started"
        );

        let mut status = StatusInfo::state("running");
        status.can_interrupt = Some(true);
        let _ = tx.send(ServerEnvelope::Status(status)).await;

        let manager = self.clone();
        let pump_key = key.clone();
        let pump_tx = tx.clone();
        let is_new = resume_id.is_none();
        tokio::spawn(async move {
            manager.pump(pump_key, run, is_new, pump_tx).await;
        });

        Ok(key)
    }

    /// Interrupt a live run: graceful termination first, forced kill
    /// after the grace period. The resulting `exit` envelope is tagged
    /// as interrupted rather than crashed.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let run = self
            .runs
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        run.interrupted.store(true, Ordering::SeqCst);
        tracing::info!(session = %session_id, "interrupting assistant run");
        run.process.terminate(true).await?;
        Ok(())
    }

    /// Whether a live, running process currently exists for this id.
    pub async fn can_interrupt(&self, session_id: &str) -> bool {
        self.runs
            .read()
            .await
            .get(session_id)
            .map(|run| run.process.is_live())
            .unwrap_or(false)
    }

    async fn resolve_cwd(&self, options: &SpawnOptions) -> Result<PathBuf, SessionError> {
        if let Some(cwd) = &options.cwd {
            return Ok(PathBuf::from(cwd));
        }
        if let Some(project) = &options.project_path {
            return self.projects.resolve_working_dir(project).await;
        }
        Ok(std::env::current_dir()?)
    }

    /// Drain the CLI's output stream: parse records, forward them live,
    /// hand them to history, and finish with exactly one exit envelope.
    async fn pump(
        &self,
        key: String,
        run: AssistantRun,
        is_new: bool,
        tx: mpsc::Sender<ServerEnvelope>,
    ) {
        let mut rx = run.process.subscribe();
        let mut announced_id: Option<String> = None;
        let mut delivered = 0usize;
        let mut malformed = 0usize;

        loop {
            match rx.recv().await {
                Ok(ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    data,
                }) => {
                    if data.trim().is_empty() {
                        continue;
                    }
                    let record: serde_json::Value = match serde_json::from_str(&data) {
                        Ok(record) => record,
                        Err(e) => {
                            malformed += 1;
                            tracing::warn!(session = %key, error = %e, "dropping malformed CLI record");
                            continue;
                        }
                    };

                    if announced_id.is_none() {
                        if let Some(sid) = record.get("session_id").and_then(|v| v.as_str()) {
                            announced_id = Some(sid.to_string());
                            if sid != key {
                                // Alias the CLI-reported id onto this run.
                                self.runs.write().await.insert(sid.to_string(), run.clone());
                            }
                            let _ = tx
                                .send(ServerEnvelope::SessionId {
                                    session_id: sid.to_string(),
                                    is_new_session: is_new,
                                })
                                .await;
                        }
                    }

                    delivered += 1;
                    let _ = tx
                        .send(ServerEnvelope::Output {
                            data: record.clone(),
                        })
                        .await;

                    // History is strictly after live delivery and must
                    // never block it.
                    let history = self.history.clone();
                    let sid = announced_id.clone().unwrap_or_else(|| key.clone());
                    tokio::spawn(async move {
                        history.append(&sid, &record).await;
                    });
                }
                Ok(ProcessEvent::Output { data, .. }) => {
                    // Stderr carries CLI diagnostics, never records.
                    tracing::debug!(session = %key, line = %data, "assistant stderr");
                }
                Ok(ProcessEvent::Exit { code, signal }) => {
                    let interrupted = run.interrupted.load(Ordering::SeqCst);
                    if delivered == 0 && malformed > 0 && !interrupted {
                        // The only records this session ever produced were
                        // unparseable; synthesize the one visible error.
                        let _ = tx
                            .send(ServerEnvelope::Error {
                                error: "assistant produced no parseable output".to_string(),
                            })
                            .await;
                    }
                    let _ = tx
                        .send(ServerEnvelope::Exit {
                            exit_code: code,
                            signal,
                            interrupted,
                        })
                        .await;
                    let mut status = StatusInfo::state(run.process.state().as_str());
                    status.can_interrupt = Some(false);
                    let _ = tx.send(ServerEnvelope::Status(status)).await;
                    tracing::info!(
                        session = %key,
                        code = ?code,
                        interrupted,
                        records = delivered,
                        "assistant run finished"
                    );
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(session = %key, skipped = n, "assistant output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        // The run is inactive; its identity stays resumable via --resume.
        let mut runs = self.runs.write().await;
        runs.retain(|_, r| !Arc::ptr_eq(&r.process, &run.process));
    }
}

/// Build the CLI argument list. The tool-permission policy is passed
/// through verbatim; the manager never interprets it.
fn build_args(prompt: &str, options: &SpawnOptions, resume_id: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = vec!["--print".into(), prompt.to_string()];
    if let Some(id) = resume_id {
        args.push("--resume".into());
        args.push(id.to_string());
    }
    args.push("--output-format".into());
    args.push("stream-json".into());
    args.push("--verbose".into());
    if let Some(model) = &options.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if options.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    } else {
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(options.allowed_tools.join(","));
        }
        if !options.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.push(options.disallowed_tools.join(","));
        }
    }
    args
}
