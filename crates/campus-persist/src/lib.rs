//! # Campus Persist
//!
//! SQLite storage for the campus job queue. Several worker processes may
//! share one database file; leases stay exclusive across all of them.

pub mod queue;
pub mod sqlite;

pub use queue::SqliteQueueBackend;
pub use sqlite::{connect, SqliteConfig, StorageError};
