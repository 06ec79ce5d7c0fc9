//! One handler per registered route.

pub mod assistant;
pub mod devserver;
pub mod shell;
