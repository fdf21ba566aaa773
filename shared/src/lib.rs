//! Shared types and utilities for Conduit
//!
//! This crate contains the data model used by the interop core and the CLI:
//! adapter identities, queue capability requests, resolved queue bindings and
//! transfer payloads.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{adapter::*, payload::*, queue::*};
