//! Process lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed process.
///
/// Transitions are monotonic: `starting → running → stopping → stopped`,
/// with `error` reachable from any non-terminal state. `stopping` is never
/// skipped on the way to `stopped` except when the spawn itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessState {
    /// A terminal state: the process is gone and no further transitions
    /// are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// A live state: a process exists (or is being created) for this entry.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether moving to `next` respects the monotonic ordering.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        match (self, next) {
            (_, _) if self == next => false,
            (s, _) if s.is_terminal() => false,
            (_, Self::Error) => true,
            (Self::Starting, Self::Running) => true,
            (Self::Starting, Self::Stopping) => true,
            (Self::Running, Self::Stopping) => true,
            (Self::Stopping, Self::Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
