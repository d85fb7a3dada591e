//! Single-writer transactions over the snapshot lineage.
//!
//! ```text
//!   head ──► CID_n ──(begin)──► Transaction { base = CID_n, pending writes }
//!                                   │
//!                              commit│ apply to copy of base, validate, store
//!                                   ▼
//!   head ──► CID_n+1      CommitRecord { parent: CID_n, cid: CID_n+1 }
//! ```
//!
//! Readers never block: they read whichever CID `head` names when they ask.
//! At most one `Transaction` exists at a time; it holds the writer lock until
//! it is committed, rolled back or dropped.

use crate::error::{StorageError, StorageResult};
use crate::snapshot::SnapshotStore;
use chrono::{DateTime, Utc};
use cidgraph_graph::{Cid, KnowledgeGraph, Node, NodeId, Properties, RelId, Relationship, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

const HEAD_FILE: &str = "HEAD";
const COMMITS_FILE: &str = "commits.json";

// ============================================================================
// Commit log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub tx_id: Uuid,
    pub cid: Cid,
    pub parent: Option<Cid>,
    pub committed_at: DateTime<Utc>,
    /// Buffered writes applied by the commit.
    pub writes: usize,
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    CreateNode {
        id: NodeId,
        labels: Vec<String>,
        properties: Properties,
    },
    CreateRelationship {
        id: RelId,
        rel_type: String,
        start: NodeId,
        end: NodeId,
        properties: Properties,
    },
    DeleteNode {
        id: NodeId,
        detach: bool,
    },
    DeleteRelationship {
        id: RelId,
    },
    SetNodeProperty {
        id: NodeId,
        key: String,
        value: Value,
    },
}

pub struct Transaction {
    id: Uuid,
    state: TxState,
    manager: TransactionManager,
    base_cid: Option<Cid>,
    base: Arc<KnowledgeGraph>,
    pending_writes: Vec<PendingWrite>,
    next_node_id: u32,
    next_rel_id: u32,
    _writer: OwnedMutexGuard<()>,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Head CID this transaction started from.
    pub fn base_cid(&self) -> Option<Cid> {
        self.base_cid
    }

    /// The snapshot this transaction started from (pending writes not applied).
    pub fn base(&self) -> &KnowledgeGraph {
        &self.base
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.len()
    }

    /// Buffer a node creation; the id is final once committed.
    pub fn create_node<L, S>(&mut self, labels: L, properties: Properties) -> NodeId
    where
        L: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id = self.next_node_id.saturating_add(1);
        self.pending_writes.push(PendingWrite::CreateNode {
            id,
            labels: labels.into_iter().map(Into::into).collect(),
            properties,
        });
        id
    }

    /// Buffer a relationship creation. Endpoints are validated at commit, so
    /// they may be nodes created earlier in this transaction.
    pub fn create_relationship(
        &mut self,
        rel_type: impl Into<String>,
        start: NodeId,
        end: NodeId,
        properties: Properties,
    ) -> RelId {
        let id = RelId::new(self.next_rel_id);
        self.next_rel_id = self.next_rel_id.saturating_add(1);
        self.pending_writes.push(PendingWrite::CreateRelationship {
            id,
            rel_type: rel_type.into(),
            start,
            end,
            properties,
        });
        id
    }

    pub fn delete_node(&mut self, id: NodeId, detach: bool) {
        self.pending_writes
            .push(PendingWrite::DeleteNode { id, detach });
    }

    pub fn delete_relationship(&mut self, id: RelId) {
        self.pending_writes
            .push(PendingWrite::DeleteRelationship { id });
    }

    pub fn set_node_property(&mut self, id: NodeId, key: impl Into<String>, value: Value) {
        self.pending_writes.push(PendingWrite::SetNodeProperty {
            id,
            key: key.into(),
            value,
        });
    }

    /// Apply the buffer to a copy of the base snapshot, store it and move the
    /// head. On any error nothing is published and the writer lock is released.
    pub async fn commit(mut self) -> StorageResult<CommitRecord> {
        let writes = self.pending_writes.len();
        let working = match apply_writes((*self.base).clone(), &self.pending_writes) {
            Ok(graph) => graph,
            Err(err) => {
                tracing::warn!(tx_id = %self.id, error = %err, "commit rejected");
                self.state = TxState::RolledBack;
                return Err(err.into());
            }
        };

        let cid = match self.manager.inner.snapshots.store_shared(Arc::new(working)).await {
            Ok(cid) => cid,
            Err(err) => {
                self.state = TxState::RolledBack;
                return Err(err);
            }
        };

        let record = CommitRecord {
            tx_id: self.id,
            cid,
            parent: self.base_cid,
            committed_at: Utc::now(),
            writes,
        };
        if let Err(err) = self.manager.publish(&record).await {
            self.state = TxState::RolledBack;
            return Err(err);
        }

        self.state = TxState::Committed;
        self.pending_writes.clear();
        tracing::info!(
            tx_id = %self.id,
            %cid,
            parent = ?self.base_cid,
            writes,
            "transaction committed"
        );
        Ok(record)
    }

    /// Discard the buffer and release the writer lock.
    pub fn rollback(mut self) {
        self.state = TxState::RolledBack;
        self.pending_writes.clear();
        tracing::info!(tx_id = %self.id, "transaction rolled back");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            tracing::debug!(
                tx_id = %self.id,
                discarded = self.pending_writes.len(),
                "uncommitted transaction dropped; rolled back"
            );
            self.state = TxState::RolledBack;
        }
    }
}

fn apply_writes(
    mut graph: KnowledgeGraph,
    writes: &[PendingWrite],
) -> Result<KnowledgeGraph, cidgraph_graph::GraphError> {
    for write in writes {
        match write {
            PendingWrite::CreateNode {
                id,
                labels,
                properties,
            } => graph.insert_node(Node {
                id: *id,
                labels: labels.iter().cloned().collect(),
                properties: properties.clone(),
            })?,
            PendingWrite::CreateRelationship {
                id,
                rel_type,
                start,
                end,
                properties,
            } => graph.insert_relationship(Relationship {
                id: *id,
                rel_type: rel_type.clone(),
                start: *start,
                end: *end,
                properties: properties.clone(),
            })?,
            PendingWrite::DeleteNode { id, detach } => {
                graph.delete_node(*id, *detach)?;
            }
            PendingWrite::DeleteRelationship { id } => {
                graph.delete_relationship(*id)?;
            }
            PendingWrite::SetNodeProperty { id, key, value } => {
                graph.set_node_property(*id, key.clone(), value.clone())?
            }
        }
    }
    Ok(graph)
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the head pointer and the writer lock. Cheap to clone.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    snapshots: Arc<SnapshotStore>,
    head: RwLock<Option<Cid>>,
    history: RwLock<Vec<CommitRecord>>,
    writer: Arc<Mutex<()>>,
    data_dir: Option<PathBuf>,
}

impl TransactionManager {
    /// In-memory head; history is lost when the manager is dropped.
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self::with_state(snapshots, None, Vec::new(), None)
    }

    /// Persistent head: reloads `HEAD` and `commits.json` from `data_dir`.
    pub async fn open(
        snapshots: Arc<SnapshotStore>,
        data_dir: impl AsRef<Path>,
    ) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| StorageError::io(&data_dir, e))?;

        let head_path = data_dir.join(HEAD_FILE);
        let head_file = match tokio::fs::read_to_string(&head_path).await {
            Ok(text) => Some(text.trim().parse::<Cid>()?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StorageError::io(&head_path, e)),
        };

        let commits_path = data_dir.join(COMMITS_FILE);
        let history: Vec<CommitRecord> = match tokio::fs::read_to_string(&commits_path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| StorageError::CommitLog {
                path: commits_path.clone(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::io(&commits_path, e)),
        };

        // The commit log is the commit point; HEAD only mirrors its tail.
        let head = match history.last() {
            Some(last) => {
                if head_file != Some(last.cid) {
                    tracing::warn!(
                        head_file = ?head_file,
                        log_tail = %last.cid,
                        "HEAD disagrees with commit log; using log tail"
                    );
                }
                Some(last.cid)
            }
            None => head_file,
        };
        if let Some(cid) = head {
            if !snapshots.contains(&cid).await? {
                return Err(StorageError::NotFound(cid));
            }
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            head = ?head,
            commits = history.len(),
            "transaction manager opened"
        );
        Ok(Self::with_state(snapshots, head, history, Some(data_dir)))
    }

    fn with_state(
        snapshots: Arc<SnapshotStore>,
        head: Option<Cid>,
        history: Vec<CommitRecord>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                snapshots,
                head: RwLock::new(head),
                history: RwLock::new(history),
                writer: Arc::new(Mutex::new(())),
                data_dir,
            }),
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.inner.snapshots
    }

    /// Current head CID (`None` before the first commit).
    pub fn head(&self) -> Option<Cid> {
        *self.inner.head.read()
    }

    /// Snapshot named by the head; an empty graph before the first commit.
    pub async fn head_snapshot(&self) -> StorageResult<Arc<KnowledgeGraph>> {
        match self.head() {
            Some(cid) => self.inner.snapshots.retrieve(&cid).await,
            None => Ok(Arc::new(KnowledgeGraph::new())),
        }
    }

    pub fn history(&self) -> Vec<CommitRecord> {
        self.inner.history.read().clone()
    }

    /// Start a transaction, waiting for any active writer to finish.
    pub async fn begin(&self) -> StorageResult<Transaction> {
        let guard = Arc::clone(&self.inner.writer).lock_owned().await;
        self.start(guard).await
    }

    /// Start a transaction or fail with `WriterBusy` if one is active.
    pub async fn try_begin(&self) -> StorageResult<Transaction> {
        let guard = Arc::clone(&self.inner.writer)
            .try_lock_owned()
            .map_err(|_| StorageError::WriterBusy)?;
        self.start(guard).await
    }

    async fn start(&self, guard: OwnedMutexGuard<()>) -> StorageResult<Transaction> {
        let base_cid = self.head();
        let base = self.head_snapshot().await?;
        let id = Uuid::new_v4();
        tracing::debug!(tx_id = %id, base = ?base_cid, "transaction started");
        Ok(Transaction {
            id,
            state: TxState::Active,
            manager: self.clone(),
            base_cid,
            next_node_id: base.next_node_id().raw(),
            next_rel_id: base.next_relationship_id().raw(),
            base,
            pending_writes: Vec::new(),
            _writer: guard,
        })
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn run<F, T, E>(&self, f: F) -> Result<(T, CommitRecord), E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx) {
            Ok(value) => {
                let record = tx.commit().await?;
                Ok((value, record))
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Persist (if configured), then swap the head and append to history.
    /// Appending to `commits.json` (temp file + rename) is the commit point.
    async fn publish(&self, record: &CommitRecord) -> StorageResult<()> {
        if let Some(dir) = &self.inner.data_dir {
            let mut history = self.history();
            history.push(record.clone());
            let json = serde_json::to_string_pretty(&history).map_err(|e| {
                StorageError::CommitLog {
                    path: dir.join(COMMITS_FILE),
                    message: e.to_string(),
                }
            })?;
            write_atomically(&dir.join(COMMITS_FILE), json.as_bytes()).await?;
            // Durable from here on; a stale HEAD is repaired by `open`.
            let head_path = dir.join(HEAD_FILE);
            if let Err(err) =
                write_atomically(&head_path, record.cid.to_string().as_bytes()).await
            {
                tracing::warn!(
                    path = %head_path.display(),
                    error = %err,
                    "HEAD not updated; commit log holds the new head"
                );
            }
        }

        let mut head = self.inner.head.write();
        let mut history = self.inner.history.write();
        *head = Some(record.cid);
        history.push(record.clone());
        Ok(())
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))
}
