//! Message envelope: the single wire format for all connection traffic.
//!
//! Every frame exchanged with a client is one of these tagged shapes, so
//! generic display and logging code never needs to know which manager
//! produced a message. Inbound and outbound sets are closed; unknown
//! inbound types deserialize to [`ClientEnvelope::Unknown`] and are
//! ignored by handlers.

use serde::{Deserialize, Serialize};

/// Messages a client sends to a manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Raw keystroke bytes for a PTY-backed shell.
    Input { data: String },

    /// New PTY geometry.
    Resize { cols: u16, rows: u16 },

    /// Start (or resume) an assistant CLI run.
    #[serde(rename = "claude-command")]
    ClaudeCommand {
        #[serde(default)]
        command: String,
        #[serde(default)]
        options: SpawnOptions,
    },

    /// Interrupt a running assistant session.
    Interrupt {
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Caller-supplied options for an assistant CLI run. The tool-permission
/// policy is passed through to the spawned process, never interpreted here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    /// Project identifier, resolved to a working directory by the
    /// project metadata collaborator.
    pub project_path: Option<String>,
    /// Explicit working directory; takes precedence over `project_path`.
    pub cwd: Option<String>,
    /// Existing session identity to resume.
    pub session_id: Option<String>,
    pub resume: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub model: Option<String>,
}

/// Messages a manager sends to a connection or broadcast group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEnvelope {
    /// Session identity assigned to this connection/run. Sent exactly once,
    /// as early as possible, so the client can persist it.
    #[serde(rename = "session-id", rename_all = "camelCase")]
    SessionId {
        session_id: String,
        is_new_session: bool,
    },

    /// One chunk of process output, in arrival order. A string for shell
    /// sessions, a structured record for assistant sessions.
    Output { data: serde_json::Value },

    /// Lifecycle status snapshot.
    Status(StatusInfo),

    /// One dev-server log line, tagged by originating stream.
    Log { stream: LogStream, data: String },

    /// Terminal event: the underlying process is gone.
    #[serde(rename_all = "camelCase")]
    Exit {
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(default)]
        interrupted: bool,
    },

    /// Fatal-to-the-session failure. At most one per session.
    Error { error: String },
}

/// Status payload shared by the dev-server and assistant managers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    /// Lifecycle state name (`starting`, `running`, `stopping`, `stopped`,
    /// `error`).
    pub state: String,
    /// Discovered dev-server URL, when a port was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Whether a live run can currently be interrupted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_interrupt: Option<bool>,
}

impl StatusInfo {
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            url: None,
            can_interrupt: None,
        }
    }
}

/// Which stream a dev-server log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}
