//! Defense engine for Shield Stack.
//!
//! This module contains the layered defense pipeline:
//! - Input Sanitization: normalizes obfuscated input
//! - Pattern Analysis: keyword and phrase matching
//! - Context Analysis: detects borrowed-authority claims
//! - Output Verification: rule checks on the protected system's response
//! - Response Verification: decides whether the attack achieved its goal
//! - Trust Boundary Validator: guards every coordination write
//! - Defense Pipeline: orchestrates all layers for one request

mod context;
mod layer;
mod output;
mod patterns;
mod pipeline;
mod sanitizer;
mod target;
mod trust;
mod verifier;

pub use context::*;
pub use layer::*;
pub use output::*;
pub use patterns::*;
pub use pipeline::*;
pub use sanitizer::*;
pub use target::*;
pub use trust::*;
pub use verifier::*;
