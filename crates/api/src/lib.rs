// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sketchforge API Library
//!
//! The HTTP surface over the credit ledger: webhook ingestion, the paid
//! generation endpoint, and balance/history reads, plus the reqwest
//! adapters for the external generation provider and media storage.

pub mod auth;
pub mod clients;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
