//! Session managers for bosun.
//!
//! Three managers share the [`bosun_process`] supervision primitive:
//! PTY-backed interactive shells, assistant CLI runs, and project
//! dev-servers. Each owns a registry mapping session/project identity to
//! its live process and guarantees at most one live process per identity.

pub mod assistant;
pub mod devserver;
pub mod history;
pub mod project;
pub mod shell;

pub use assistant::{AssistantConfig, AssistantManager};
pub use devserver::{DevServerConfig, DevServerManager, StartResult, StopResult};
pub use history::{NullHistory, SessionHistory};
pub use project::{PackageManifestStore, ProjectStore};
pub use shell::{ShellConfig, ShellManager, ShellSession};

/// Errors surfaced by the session managers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Process(#[from] bosun_process::ProcessError),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session already running: {0}")]
    AlreadyRunning(String),

    #[error("script not found")]
    ScriptNotFound,

    #[error("cannot resolve working directory: {0}")]
    WorkingDirectory(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
