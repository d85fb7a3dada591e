//! Cidgraph storage layer
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CIDGRAPH STORAGE                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────┐   begin/commit   ┌──────────────────┐       │
//! │  │ Transaction │─────────────────►│ TransactionMgr   │       │
//! │  │  (buffer)   │                  │ head + commit log│       │
//! │  └─────────────┘                  └────────┬─────────┘       │
//! │                                            │ store/retrieve  │
//! │                                   ┌────────▼─────────┐       │
//! │                                   │  SnapshotStore   │       │
//! │                                   │ (decoded LRU)    │       │
//! │                                   └────────┬─────────┘       │
//! │                                            │ put/get         │
//! │                                   ┌────────▼─────────┐       │
//! │                                   │ CachedBlockStore │       │
//! │                                   │ memory | fs      │       │
//! │                                   └──────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Content addressed**: every block is named by the hash of its bytes
//! - **Immutable snapshots**: updates produce new CIDs, old ones stay readable
//! - **Single writer**: one transaction at a time, readers never wait
//! - **Durable head**: optional `HEAD` + `commits.json` in a data directory

pub mod block;
pub mod cache;
pub mod error;
pub mod snapshot;
pub mod transaction;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use block::{Block, BlockStore, BlockStoreStats, CachedBlockStore, FsBlockStore, MemoryBlockStore};
pub use cache::{CacheEntry, CacheStats, LruCache};
pub use error::{StorageError, StorageResult};
pub use snapshot::SnapshotStore;
pub use transaction::{CommitRecord, Transaction, TransactionManager, TxState};

// ============================================================================
// Storage Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for blocks, `HEAD` and `commits.json`. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Raw block LRU capacity (blocks).
    pub block_cache_capacity: usize,
    /// Decoded snapshot LRU capacity (snapshots).
    pub snapshot_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            block_cache_capacity: 1024,
            snapshot_cache_capacity: 16,
        }
    }
}

// ============================================================================
// Storage bundle
// ============================================================================

/// Block store, snapshot store and transaction manager wired together.
#[derive(Clone)]
pub struct Storage {
    snapshots: Arc<SnapshotStore>,
    transactions: TransactionManager,
}

impl Storage {
    pub async fn open(config: &StorageConfig) -> StorageResult<Self> {
        match &config.data_dir {
            Some(dir) => {
                let fs = FsBlockStore::open(dir).await?;
                let blocks: Arc<dyn BlockStore> =
                    Arc::new(CachedBlockStore::new(fs, config.block_cache_capacity));
                let snapshots = Arc::new(SnapshotStore::new(blocks, config.snapshot_cache_capacity));
                let transactions = TransactionManager::open(Arc::clone(&snapshots), dir).await?;
                Ok(Self {
                    snapshots,
                    transactions,
                })
            }
            None => Ok(Self::in_memory(config)),
        }
    }

    pub fn in_memory(config: &StorageConfig) -> Self {
        let blocks: Arc<dyn BlockStore> = Arc::new(CachedBlockStore::new(
            MemoryBlockStore::new(),
            config.block_cache_capacity,
        ));
        let snapshots = Arc::new(SnapshotStore::new(blocks, config.snapshot_cache_capacity));
        let transactions = TransactionManager::new(Arc::clone(&snapshots));
        Self {
            snapshots,
            transactions,
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }
}
