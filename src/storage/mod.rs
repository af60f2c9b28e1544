//! SQLite persistence layer for VaultSync.
//!
//! This module provides the durable identity map with:
//! - WAL mode for concurrent reads
//! - Per-path reservation leases for mutation discipline
//! - Dead-letter storage for exhausted operations
//!
//! # Submodules
//!
//! - [`schema`] - Database schema definitions
//! - [`migrations`] - Versioned migration runner
//! - [`sqlite`] - The [`IdentityStore`] implementation

pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use sqlite::{IdentityStore, LeaseToken, StateCounts};
