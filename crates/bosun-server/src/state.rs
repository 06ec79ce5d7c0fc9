//! Shared server state handed to every connection handler.

use bosun_session::{AssistantManager, DevServerManager, ShellManager};

/// One instance per server; cheap to clone into connection tasks.
#[derive(Clone)]
pub struct AppState {
    pub shell: ShellManager,
    pub assistant: AssistantManager,
    pub devserver: DevServerManager,
    /// When set, assistant runs keep going after their connection drops
    /// so the session can be resumed later. When cleared, a connection
    /// drop interrupts the runs it started.
    pub assistant_detach: bool,
}
