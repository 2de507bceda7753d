//! Storage Module
//!
//! SQLite-based storage layer. One database is the sole shared resource of
//! the substrate: the heartbeat worker and the maintenance worker coordinate
//! exclusively through it, each multi-row mutation inside one transaction.

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{CoreError, MemoryStats, Result, Storage};
