//! Persistence: SQLite tweet store, bounded write queue, change notifications.

pub mod notify;
pub mod queue;
pub mod sqlite;
