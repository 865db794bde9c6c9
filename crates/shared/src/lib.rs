//! Sketchforge shared infrastructure
//!
//! Database pool construction and embedded migrations, used by the api
//! binary and by the ledger crate's integration points.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations};
