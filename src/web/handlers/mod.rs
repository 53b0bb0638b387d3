//! Worker Web API Handlers
//!
//! HTTP request handlers for all worker web endpoints.

pub mod health;
pub mod metrics;
pub mod process;
