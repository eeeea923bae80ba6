//! Command-line interface
//!
//! Argument parsing for the node binary; `main.rs` runs the commands.

pub mod commands;

pub use commands::{AllocationArg, Command, Opt};
