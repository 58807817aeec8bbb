//! Storage layer for Shield Stack.
//!
//! Persists execution traces and failed runs via SQLx with SQLite.

mod models;
mod repository;

pub use repository::{connect, TraceRepository, TraceStore};
