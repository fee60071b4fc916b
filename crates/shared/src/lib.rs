// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stowage Shared
//!
//! Domain types and database plumbing shared by the API, billing, and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{Account, Plan, SubscriptionStatus};
