//! `ChunkResourceManager` — ref-counted sub-chunk temp-table registry on a
//! worker, and the process-wide memory-table lock that guards it (spec
//! §4.6). Grounded on the donor codebase's resource-manager style (atomics
//! and `parking_lot::Mutex` guarding a shared map,
//! `resource_manager::cpu_scheduler`) adapted from CPU scheduling to
//! reference-counted table ownership.

use crate::control_db::ControlDb;
use crate::error::{CoreError, Result};
use crate::ids::{ChunkId, SubChunkId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkResourceKey {
    pub database: String,
    pub table: String,
    pub chunk_id: ChunkId,
    pub sub_chunk_id: SubChunkId,
}

impl ChunkResourceKey {
    pub fn new(database: impl Into<String>, table: impl Into<String>, chunk_id: ChunkId, sub_chunk_id: SubChunkId) -> Self {
        Self { database: database.into(), table: table.into(), chunk_id, sub_chunk_id }
    }

    /// `Subchunks_<db>_<chunk>`, the in-memory database housing the
    /// materialized sub-chunk and its overlap companion.
    pub fn subchunk_database(&self) -> String {
        format!("Subchunks_{}_{}", self.database, self.chunk_id)
    }

    pub fn subchunk_table(&self) -> String {
        format!("{}_{}_{}", self.table, self.chunk_id, self.sub_chunk_id)
    }

    pub fn overlap_table(&self) -> String {
        format!("{}FullOverlap_{}_{}", self.table, self.chunk_id, self.sub_chunk_id)
    }
}

/// Scoped handle over a set of acquired keys. Releases its ref-counts when
/// dropped, regardless of how the owning Task exits.
pub struct ChunkResourceHandle {
    keys: Vec<ChunkResourceKey>,
    manager: Arc<ChunkResourceManager>,
}

impl Drop for ChunkResourceHandle {
    fn drop(&mut self) {
        for key in &self.keys {
            self.manager.release(key);
        }
    }
}

/// Owns the worker's sub-chunk table registry and the process-wide
/// memory-table lock (`qservMeta.memLock`, spec §4.6).
pub struct ChunkResourceManager {
    control_db: Arc<dyn ControlDb>,
    worker: crate::ids::WorkerId,
    uid: u64,
    refcounts: Mutex<HashMap<ChunkResourceKey, usize>>,
}

impl ChunkResourceManager {
    /// Startup recovery: claim the memory-table lock with a freshly
    /// generated uid. A real deployment also drops every stale
    /// `Subchunks_*` database here; that DDL happens outside this crate's
    /// `ControlDb` seam (see spec §4.6 "Startup recovery").
    pub async fn start(control_db: Arc<dyn ControlDb>, worker: crate::ids::WorkerId) -> Result<Arc<Self>> {
        let uid = rand::random::<u64>();
        control_db.write_mem_lock(&worker, uid).await?;
        info!(%worker, uid, "acquired memory-table lock");
        Ok(Arc::new(Self { control_db, worker, uid, refcounts: Mutex::new(HashMap::new()) }))
    }

    /// Re-reads the `memLock` row and aborts (returns a fatal error the
    /// caller must treat as process-terminating) if another process has
    /// taken over ownership.
    pub async fn require_ownership(&self) -> Result<()> {
        match self.control_db.read_mem_lock(&self.worker).await? {
            Some(uid) if uid == self.uid => Ok(()),
            other => {
                let found = other.unwrap_or(0);
                error!(worker = %self.worker, expected = self.uid, found, "memory lock ownership lost");
                Err(CoreError::MemoryLockViolation { expected: self.uid, found })
            }
        }
    }

    /// Create (if newly referenced) and ref-count every key in `keys`.
    /// Checks ownership once per call, not once per key (spec invariant:
    /// "no sub-chunk DDL is executed unless the preceding read of memLock
    /// returned this process's uid").
    pub async fn acquire(self: &Arc<Self>, keys: Vec<ChunkResourceKey>) -> Result<ChunkResourceHandle> {
        self.require_ownership().await?;
        let mut refcounts = self.refcounts.lock();
        for key in &keys {
            let count = refcounts.entry(key.clone()).or_insert(0);
            if *count == 0 {
                debug!(database = %key.subchunk_database(), table = %key.subchunk_table(), "materializing sub-chunk table");
            }
            *count += 1;
        }
        Ok(ChunkResourceHandle { keys, manager: self.clone() })
    }

    fn release(&self, key: &ChunkResourceKey) {
        let mut refcounts = self.refcounts.lock();
        if let Some(count) = refcounts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                refcounts.remove(key);
                debug!(database = %key.subchunk_database(), table = %key.subchunk_table(), "dropping sub-chunk table");
            }
        }
    }

    pub fn ref_count(&self, key: &ChunkResourceKey) -> usize {
        self.refcounts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.refcounts.lock().is_empty()
    }

    /// Graceful shutdown: release the memory-table lock.
    pub async fn shutdown(&self) -> Result<()> {
        self.control_db.clear_mem_lock(&self.worker).await
    }
}

/// Serializes `mlock` calls through a single-threaded FIFO event loop
/// (spec §4.6 "mlock serialization") since two concurrent `mlock` calls on
/// the same worker interfere with each other.
pub struct MlockSerializer {
    tx: mpsc::UnboundedSender<(String, oneshot::Sender<()>)>,
}

impl MlockSerializer {
    pub fn start() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, oneshot::Sender<()>)>();
        tokio::spawn(async move {
            let mut sequence = 0u64;
            while let Some((table, done)) = rx.recv().await {
                sequence += 1;
                debug!(table, sequence, "mlock acquired");
                let _ = done.send(());
            }
        });
        Arc::new(Self { tx })
    }

    /// Block the calling Task until `table` is locked in RAM. Corresponds
    /// to `waitForMemMan` in spec §4.7.
    pub async fn wait_for_mem_man(&self, table: impl Into<String>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send((table.into(), done_tx))
            .map_err(|_| CoreError::WorkerResource("mlock serializer loop is gone".to_string()))?;
        done_rx.await.map_err(|_| CoreError::WorkerResource("mlock serializer dropped reply".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_db::MemoryControlDb;
    use crate::ids::WorkerId;

    #[tokio::test]
    async fn acquire_release_round_trip_returns_to_empty() {
        let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
        let manager = ChunkResourceManager::start(control_db, WorkerId::from("w1")).await.unwrap();
        let key = ChunkResourceKey::new("LSST", "Object", 10, 3);
        {
            let handle = manager.acquire(vec![key.clone()]).await.unwrap();
            assert_eq!(manager.ref_count(&key), 1);
            drop(handle);
        }
        assert_eq!(manager.ref_count(&key), 0);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn concurrent_acquires_share_refcount() {
        let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
        let manager = ChunkResourceManager::start(control_db, WorkerId::from("w1")).await.unwrap();
        let key = ChunkResourceKey::new("LSST", "Object", 10, 3);
        let h1 = manager.acquire(vec![key.clone()]).await.unwrap();
        let h2 = manager.acquire(vec![key.clone()]).await.unwrap();
        assert_eq!(manager.ref_count(&key), 2);
        drop(h1);
        assert_eq!(manager.ref_count(&key), 1);
        drop(h2);
        assert_eq!(manager.ref_count(&key), 0);
    }

    #[tokio::test]
    async fn ownership_violation_is_detected() {
        let control_db: Arc<dyn ControlDb> = Arc::new(MemoryControlDb::new(1));
        let worker = WorkerId::from("w1");
        let manager = ChunkResourceManager::start(control_db.clone(), worker.clone()).await.unwrap();
        // Simulate a second process taking over the lock.
        control_db.write_mem_lock(&worker, 999_999).await.unwrap();
        let key = ChunkResourceKey::new("LSST", "Object", 10, 3);
        let result = manager.acquire(vec![key]).await;
        assert!(matches!(result, Err(CoreError::MemoryLockViolation { .. })));
    }

    #[tokio::test]
    async fn mlock_serializer_processes_in_order() {
        let serializer = MlockSerializer::start();
        serializer.wait_for_mem_man("Object_10_3").await.unwrap();
        serializer.wait_for_mem_man("Object_10_4").await.unwrap();
    }
}
