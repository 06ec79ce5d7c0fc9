//! Shared types for bosun: the wire envelope and id helpers.

pub mod envelope;
pub mod id;

pub use envelope::{ClientEnvelope, LogStream, ServerEnvelope, SpawnOptions, StatusInfo};
pub use id::{new_correlation_id, new_id};
