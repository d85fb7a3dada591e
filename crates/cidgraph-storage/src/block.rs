//! Content-addressed block stores.
//!
//! A block is an opaque byte string addressed by the CID of its bytes. Stores
//! are append-only: `put` of bytes that are already present returns the
//! existing CID and writes nothing.

use crate::cache::{CacheStats, LruCache};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use cidgraph_graph::{Cid, Codec, EncodedBlock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Shared, immutable block bytes.
pub type Block = Arc<Vec<u8>>;

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store `bytes` under the CID derived from them.
    async fn put(&self, bytes: Vec<u8>, codec: Codec) -> StorageResult<Cid>;

    /// Fetch a block; `StorageError::NotFound` if absent.
    async fn get(&self, cid: &Cid) -> StorageResult<Block>;

    async fn has(&self, cid: &Cid) -> StorageResult<bool>;

    /// Store a pre-encoded block. The stored CID must match the one computed
    /// during encoding.
    async fn put_encoded(&self, block: EncodedBlock) -> StorageResult<Cid> {
        let expected = block.cid;
        let cid = self.put(block.bytes, expected.codec()).await?;
        if cid != expected {
            return Err(StorageError::Integrity { cid: expected });
        }
        Ok(cid)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub blocks_written: u64,
    pub dedup_hits: u64,
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Block>>,
    written: AtomicU64,
    dedup_hits: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BlockStoreStats {
        BlockStoreStats {
            blocks_written: self.written.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
        }
    }

    /// Overwrite a stored block without re-addressing it. Test hook for
    /// integrity checks.
    #[doc(hidden)]
    pub fn corrupt(&self, cid: &Cid, bytes: Vec<u8>) {
        self.blocks.write().insert(*cid, Arc::new(bytes));
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, bytes: Vec<u8>, codec: Codec) -> StorageResult<Cid> {
        let cid = Cid::for_bytes(codec, &bytes);
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&cid) {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%cid, "block already present");
            return Ok(cid);
        }
        blocks.insert(cid, Arc::new(bytes));
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> StorageResult<Block> {
        let block = self
            .blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(StorageError::NotFound(*cid))?;
        if !cid.verifies(&block) {
            return Err(StorageError::Integrity { cid: *cid });
        }
        Ok(block)
    }

    async fn has(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

/// One file per block under `<root>/blocks/<cid>`.
pub struct FsBlockStore {
    blocks_dir: PathBuf,
    written: AtomicU64,
    dedup_hits: AtomicU64,
}

impl FsBlockStore {
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let blocks_dir = root.as_ref().join("blocks");
        tokio::fs::create_dir_all(&blocks_dir)
            .await
            .map_err(|e| StorageError::io(&blocks_dir, e))?;
        Ok(Self {
            blocks_dir,
            written: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
        })
    }

    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    pub fn block_path(&self, cid: &Cid) -> PathBuf {
        self.blocks_dir.join(cid.to_string())
    }

    pub fn stats(&self) -> BlockStoreStats {
        BlockStoreStats {
            blocks_written: self.written.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn put(&self, bytes: Vec<u8>, codec: Codec) -> StorageResult<Cid> {
        let cid = Cid::for_bytes(codec, &bytes);
        let path = self.block_path(&cid);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?
        {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cid);
        }

        // Write-then-rename so a crash never leaves a truncated block behind.
        let tmp = self.blocks_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        self.written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%cid, bytes = bytes.len(), "block written");
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> StorageResult<Block> {
        let path = self.block_path(cid);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(*cid))
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        if !cid.verifies(&bytes) {
            tracing::warn!(%cid, path = %path.display(), "block failed integrity check");
            return Err(StorageError::Integrity { cid: *cid });
        }
        Ok(Arc::new(bytes))
    }

    async fn has(&self, cid: &Cid) -> StorageResult<bool> {
        let path = self.block_path(cid);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }
}

// ============================================================================
// LRU-wrapped store
// ============================================================================

/// Wraps any store with an LRU over `get`.
pub struct CachedBlockStore<S> {
    inner: S,
    cache: LruCache<Cid, Vec<u8>>,
}

impl<S: BlockStore> CachedBlockStore<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            cache: LruCache::new(capacity),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for CachedBlockStore<S> {
    async fn put(&self, bytes: Vec<u8>, codec: Codec) -> StorageResult<Cid> {
        self.inner.put(bytes, codec).await
    }

    async fn get(&self, cid: &Cid) -> StorageResult<Block> {
        if let Some(block) = self.cache.get(cid) {
            return Ok(block);
        }
        let block = self.inner.get(cid).await?;
        Ok(self.cache.insert_arc(*cid, block))
    }

    async fn has(&self, cid: &Cid) -> StorageResult<bool> {
        if self.cache.contains(cid) {
            return Ok(true);
        }
        self.inner.has(cid).await
    }
}

#[async_trait]
impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    async fn put(&self, bytes: Vec<u8>, codec: Codec) -> StorageResult<Cid> {
        (**self).put(bytes, codec).await
    }

    async fn get(&self, cid: &Cid) -> StorageResult<Block> {
        (**self).get(cid).await
    }

    async fn has(&self, cid: &Cid) -> StorageResult<bool> {
        (**self).has(cid).await
    }
}
