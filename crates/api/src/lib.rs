// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Auth Sandbox API Library
//!
//! Session and identity engine: signed session tokens, a single authoritative
//! session per account, refresh rotation and email verification, plus the
//! axum routes that expose them.

pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::{AppState, AuthState};
