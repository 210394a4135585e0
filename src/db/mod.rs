//! Database module for linkwatch.
//!
//! Provides SQLite storage for heartbeats and downtime events with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
