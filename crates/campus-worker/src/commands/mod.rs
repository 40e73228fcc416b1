//! CLI command implementations

pub mod enqueue;
pub mod run;
pub mod stats;
