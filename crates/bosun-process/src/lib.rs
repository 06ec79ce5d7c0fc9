//! Generic process supervision for bosun.
//!
//! Provides the shared lifecycle primitive every session manager builds
//! on: spawn a child process (optionally inside a pseudo-terminal),
//! expose its output as an order-preserving event stream, and terminate
//! it with graceful-then-forced escalation. Consumers subscribe to the
//! event stream and drive the process through [`ManagedProcess`].

pub mod event;
pub mod readiness;
pub mod state;
pub mod supervisor;

pub use event::{OutputStream, ProcessEvent};
pub use readiness::{PortLineDetector, ReadinessDetector};
pub use state::ProcessState;
pub use supervisor::{ManagedProcess, ProcessError, PtyGeometry, SpawnSpec};
