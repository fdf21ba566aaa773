//! Data model shared across crates

pub mod adapter;
pub mod payload;
pub mod queue;
