//! Deterministic chain fixtures for unit tests
//!
//! Chains built here use short consensus ranges and derive every block
//! timestamp from the miner's PoT interval, so blocks pass full validation.

pub mod test_utils;

pub use test_utils::*;
