#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the Auth Sandbox services.
//!
//! Both the API server and the maintenance worker talk to the same Postgres
//! schema, so pool construction and migrations live here.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations};
