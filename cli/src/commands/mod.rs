//! CLI commands

pub mod bench;
pub mod generate;
pub mod probe;
