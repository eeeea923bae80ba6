use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DATA_DIR_KEY: &str = "STRAND_DATA_DIR";
const KEY_FILE_KEY: &str = "STRAND_KEY_FILE";

static DEFAULT_DATA_DIR: &str = "data";
static DEFAULT_KEY_FILE: &str = "account.key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_file: PathBuf,
    /// Hex public keys seeded into every followed chain's peer set
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
            bootstrap_peers: vec![],
        }
    }
}

/// Consensus constants. Every node of a chain must agree on these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Trailing blocks that may still be reorganised by cumulative difficulty
    pub mutable_range: u64,
    /// Warning range = factor × mutable range
    pub warning_range_factor: u64,
    /// Immutable-point indirections followed before a fork is called an attack
    pub attack_depth: u32,
    /// Target average block interval in seconds
    pub block_time: u64,
    pub min_block_time: u64,
    pub max_block_time: u64,
    /// Vote responses that settle a vote before the timeout
    pub vote_quorum: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            mutable_range: 288,
            warning_range_factor: 3,
            attack_depth: 3,
            block_time: 180,
            min_block_time: 60,
            max_block_time: 300,
            vote_quorum: 20,
        }
    }
}

impl ConsensusConfig {
    pub fn warning_range(&self) -> u64 {
        self.mutable_range * self.warning_range_factor
    }

    /// Vote weight contributed by one observed tip at `height`.
    pub fn vote_weight(&self, height: u64) -> u64 {
        height.saturating_sub(self.mutable_range)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_tick_interval_ms: u64,
    pub min_tick_interval_ms: u64,
    pub max_tick_interval_ms: u64,
    /// DHT queue fill ratio above which the tick loop backs off
    pub backpressure_ratio: f64,
    /// Seconds before an unanswered request for the same item is re-issued
    pub request_retry_secs: i64,
    /// Seconds a fork candidate may wait on missing blocks before it is dropped
    pub max_deferral_secs: i64,
    pub max_priority_peers: usize,
    pub max_general_peers: usize,
    /// Probability of picking a priority peer when both sets are populated
    pub priority_peer_ratio: f64,
    pub max_pending_transactions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            initial_tick_interval_ms: 500,
            min_tick_interval_ms: 100,
            max_tick_interval_ms: 5_000,
            backpressure_ratio: 0.8,
            request_retry_secs: 10,
            max_deferral_secs: 600,
            max_priority_peers: 64,
            max_general_peers: 512,
            priority_peer_ratio: 0.6,
            max_pending_transactions: 256,
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(|e| {
            ChainError::Config(format!("Cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = env::var(DATA_DIR_KEY) {
            self.node.data_dir = PathBuf::from(dir);
        }
        if let Ok(file) = env::var(KEY_FILE_KEY) {
            self.node.key_file = PathBuf::from(file);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.consensus;
        if c.mutable_range == 0 {
            return Err(ChainError::Config("mutable_range must be positive".to_string()));
        }
        if c.warning_range_factor == 0 || c.attack_depth == 0 {
            return Err(ChainError::Config(
                "warning_range_factor and attack_depth must be positive".to_string(),
            ));
        }
        if !(c.min_block_time > 0
            && c.min_block_time <= c.block_time
            && c.block_time <= c.max_block_time)
        {
            return Err(ChainError::Config(format!(
                "block times must satisfy 0 < min ({}) <= target ({}) <= max ({})",
                c.min_block_time, c.block_time, c.max_block_time
            )));
        }
        let e = &self.engine;
        if e.min_tick_interval_ms == 0 || e.min_tick_interval_ms > e.max_tick_interval_ms {
            return Err(ChainError::Config("invalid tick interval bounds".to_string()));
        }
        if !(0.0..=1.0).contains(&e.priority_peer_ratio)
            || !(0.0..=1.0).contains(&e.backpressure_ratio)
        {
            return Err(ChainError::Config("ratios must lie in [0, 1]".to_string()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("chains")
    }
}
