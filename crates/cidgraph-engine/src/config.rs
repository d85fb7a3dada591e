//! Engine configuration.

use crate::hybrid::HybridDefaults;
use anyhow::Context;
use cidgraph_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for blocks and the commit log; `None` keeps everything in
    /// memory.
    pub data_dir: Option<PathBuf>,
    pub block_cache_capacity: usize,
    pub snapshot_cache_capacity: usize,
    /// Compiled plans, keyed by query text.
    pub plan_cache_capacity: usize,
    pub hybrid_cache_capacity: usize,
    /// Preset used when a caller does not pass explicit budgets.
    pub default_preset: String,
    /// JSON presets merged over the built-in ones.
    pub presets_file: Option<PathBuf>,
    pub hybrid: HybridDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let storage = StorageConfig::default();
        Self {
            data_dir: storage.data_dir,
            block_cache_capacity: storage.block_cache_capacity,
            snapshot_cache_capacity: storage.snapshot_cache_capacity,
            plan_cache_capacity: 256,
            hybrid_cache_capacity: 128,
            default_preset: "safe".to_string(),
            presets_file: None,
            hybrid: HybridDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("invalid engine config {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            block_cache_capacity: self.block_cache_capacity,
            snapshot_cache_capacity: self.snapshot_cache_capacity,
        }
    }
}
