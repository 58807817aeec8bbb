//! Domain types for Shield Stack.
//!
//! This module contains the request, verdict, coordination and trace
//! records that flow through the defense pipeline.

mod coordination;
mod outcome;
mod request;
mod trace;
mod verdict;

pub use coordination::*;
pub use outcome::*;
pub use request::*;
pub use trace::*;
pub use verdict::*;
