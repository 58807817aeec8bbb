//! HTTP API layer for Shield Stack.
//!
//! Provides REST endpoints for pipeline runs and stored traces.

pub mod handlers;
mod routes;
mod types;

pub use routes::build_router;
