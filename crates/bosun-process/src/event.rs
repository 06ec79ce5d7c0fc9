//! Per-process event stream.
//!
//! Each [`ManagedProcess`](crate::ManagedProcess) owns one broadcast
//! channel of [`ProcessEvent`]s. Subscribers attach at any time and
//! receive every event produced after attachment; there is no backlog
//! replay, and a lagging subscriber silently loses events rather than
//! backpressuring the process. The stream ends with a single terminal
//! [`ProcessEvent::Exit`] and is not restartable.

use serde::{Deserialize, Serialize};

/// Which pipe an output chunk came from. PTY-backed processes have a
/// single merged stream, reported as `Stdout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One unit of process activity, delivered in production order.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A chunk (PTY) or line (piped) of output.
    Output { stream: OutputStream, data: String },

    /// Terminal event: the process exited. Always the last event.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}
