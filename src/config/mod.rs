//! Configuration management
//!
//! Node paths, consensus constants and engine tuning. A `Config` is built
//! once at startup (defaults, then an optional TOML file, then environment
//! overrides) and passed down explicitly.

pub mod settings;

pub use settings::{Config, ConsensusConfig, EngineConfig, NodeConfig};
