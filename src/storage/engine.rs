use super::map::StoreMap;
use super::snapshot::{
    SnapshotInfo, SnapshotManager, SnapshotMaps, SnapshotMetadata, StoreSnapshot,
};
use super::transaction::Transaction;
use crate::core::{InventoryError, Result};
use crate::transaction::LockTable;
use im::OrdMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tracing::{Level, event};

/// Default bound on how long a transaction waits for a key lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

pub(crate) type MapData = OrdMap<String, Vec<u8>>;
pub(crate) type StoreState = OrdMap<String, MapData>;

/// How `restore` treats state that is newer than the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePolicy {
    /// Refuse to replace state that has committed past the snapshot.
    #[default]
    Safe,
    /// Overwrite unconditionally.
    Force,
}

pub(crate) struct Committed {
    pub(crate) state: StoreState,
    pub(crate) commit_seq: u64,
    /// Bumped by every restore. Transactions begun under an older epoch
    /// cannot commit writes.
    pub(crate) epoch: u64,
}

pub(crate) struct StoreInner {
    pub(crate) committed: RwLock<Committed>,
    pub(crate) locks: LockTable,
    lock_timeout: Duration,
}

/// In-process transactional store over named ordered maps.
///
/// Committed state is a structurally shared `im::OrdMap`, so `begin` takes a
/// consistent snapshot in O(1). Writers lock individual `(map, key)` pairs
/// until commit; commit applies every buffered write atomically.
#[derive(Clone)]
pub struct TransactionalStore {
    inner: Arc<StoreInner>,
}

impl Default for TransactionalStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl TransactionalStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                committed: RwLock::new(Committed {
                    state: OrdMap::new(),
                    commit_seq: 0,
                    epoch: 0,
                }),
                locks: LockTable::new(),
                lock_timeout,
            }),
        }
    }

    /// Opens (creating if absent) the named map.
    pub async fn open_map<V>(&self, name: &str) -> Result<StoreMap<V>> {
        if name.is_empty() {
            return Err(InventoryError::TransactionError("map name must not be empty".into()));
        }
        let mut committed = self.inner.committed.write().await;
        if !committed.state.contains_key(name) {
            committed.state.insert(name.to_string(), MapData::new());
        }
        Ok(StoreMap::new(name))
    }

    pub async fn begin(&self) -> Transaction {
        self.begin_with_timeout(self.inner.lock_timeout).await
    }

    pub async fn begin_with_timeout(&self, lock_timeout: Duration) -> Transaction {
        let (snapshot, epoch) = {
            let committed = self.inner.committed.read().await;
            (committed.state.clone(), committed.epoch)
        };
        Transaction::new(self.inner.clone(), snapshot, epoch, lock_timeout)
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    pub async fn commit_seq(&self) -> u64 {
        self.inner.committed.read().await.commit_seq
    }

    /// Number of key locks currently held across all transactions.
    pub fn held_locks(&self) -> usize {
        self.inner.locks.held_count()
    }

    /// Starts a full-state snapshot into `directory`.
    ///
    /// The committed state is captured before this returns; the file is
    /// written on a background task and the outcome is delivered on the
    /// returned channel.
    pub async fn begin_backup(&self, directory: PathBuf) -> oneshot::Receiver<Result<SnapshotInfo>> {
        let (state, commit_seq) = {
            let committed = self.inner.committed.read().await;
            (committed.state.clone(), committed.commit_seq)
        };

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = write_snapshot(directory, state, commit_seq).await;
            let _ = done_tx.send(result);
        });
        done_rx
    }

    /// Takes a full-state snapshot and waits for it to complete.
    pub async fn backup(&self, directory: PathBuf) -> Result<SnapshotInfo> {
        self.begin_backup(directory)
            .await
            .await
            .map_err(|_| InventoryError::IoError("snapshot writer dropped its completion channel".into()))?
    }

    /// Replaces the full state with the snapshot stored in `directory`.
    ///
    /// Transactions that began before the restore can no longer commit
    /// writes; their commit fails with `ConflictOrTimeout`.
    pub async fn restore(&self, directory: &Path, policy: RestorePolicy) -> Result<SnapshotMetadata> {
        let manager = SnapshotManager::in_directory(directory);
        let snapshot = tokio::task::spawn_blocking(move || manager.load())
            .await
            .map_err(|e| InventoryError::IoError(format!("snapshot reader join: {}", e)))??
            .ok_or_else(|| {
                InventoryError::RestoreFailure(format!("no snapshot found in {}", directory.display()))
            })?;

        let mut committed = self.inner.committed.write().await;
        if policy == RestorePolicy::Safe && snapshot.metadata.commit_seq < committed.commit_seq {
            return Err(InventoryError::RestoreFailure(format!(
                "snapshot {} is at commit {} but the store is already at commit {}",
                snapshot.metadata.snapshot_id, snapshot.metadata.commit_seq, committed.commit_seq
            )));
        }

        committed.state = state_from_maps(snapshot.maps);
        committed.commit_seq = snapshot.metadata.commit_seq;
        committed.epoch += 1;
        event!(
            Level::INFO,
            snapshot_id = %snapshot.metadata.snapshot_id,
            commit_seq = snapshot.metadata.commit_seq,
            epoch = committed.epoch,
            entries = snapshot.metadata.entry_count,
            ?policy,
            "store restored from snapshot"
        );
        Ok(snapshot.metadata)
    }
}

async fn write_snapshot(directory: PathBuf, state: StoreState, commit_seq: u64) -> Result<SnapshotInfo> {
    let snapshot = StoreSnapshot::new(maps_from_state(&state), commit_seq);
    let metadata = snapshot.metadata.clone();
    let manager = SnapshotManager::in_directory(&directory);
    tokio::task::spawn_blocking(move || manager.save(&snapshot))
        .await
        .map_err(|e| InventoryError::IoError(format!("snapshot writer join: {}", e)))??;

    event!(
        Level::DEBUG,
        snapshot_id = %metadata.snapshot_id,
        commit_seq,
        directory = %directory.display(),
        "store snapshot written"
    );
    Ok(SnapshotInfo { directory, metadata })
}

fn maps_from_state(state: &StoreState) -> SnapshotMaps {
    state
        .iter()
        .map(|(name, data)| {
            let entries = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            (name.clone(), entries)
        })
        .collect()
}

fn state_from_maps(maps: SnapshotMaps) -> StoreState {
    maps.into_iter()
        .map(|(name, entries)| (name, entries.into_iter().collect::<MapData>()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_map_is_idempotent() {
        let store = TransactionalStore::default();
        let first: StoreMap<u64> = store.open_map("counters").await.unwrap();
        let second: StoreMap<u64> = store.open_map("counters").await.unwrap();
        assert_eq!(first.name(), second.name());
        assert!(store.open_map::<u64>("").await.is_err());
    }

    #[tokio::test]
    async fn backup_then_restore_into_fresh_store() {
        let dir = TempDir::new().unwrap();
        let store = TransactionalStore::default();
        let counters: StoreMap<u64> = store.open_map("counters").await.unwrap();

        let mut tx = store.begin().await;
        tx.set(&counters, "a", &41).await.unwrap();
        tx.commit().await.unwrap();

        let info = store.backup(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(info.metadata.commit_seq, 1);
        assert_eq!(info.metadata.entry_count, 1);

        let fresh = TransactionalStore::default();
        fresh.restore(dir.path(), RestorePolicy::Safe).await.unwrap();
        let counters: StoreMap<u64> = fresh.open_map("counters").await.unwrap();
        let tx = fresh.begin().await;
        assert_eq!(tx.get(&counters, "a").await.unwrap(), Some(41));
        assert_eq!(fresh.commit_seq().await, 1);
    }

    #[tokio::test]
    async fn safe_restore_refuses_older_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = TransactionalStore::default();
        let counters: StoreMap<u64> = store.open_map("counters").await.unwrap();
        store.backup(dir.path().to_path_buf()).await.unwrap();

        let mut tx = store.begin().await;
        tx.set(&counters, "a", &1).await.unwrap();
        tx.commit().await.unwrap();

        let err = store.restore(dir.path(), RestorePolicy::Safe).await.unwrap_err();
        assert!(matches!(err, InventoryError::RestoreFailure(_)));

        store.restore(dir.path(), RestorePolicy::Force).await.unwrap();
        let tx = store.begin().await;
        assert_eq!(tx.get(&counters, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writer_begun_before_restore_cannot_commit() {
        let dir = TempDir::new().unwrap();
        let store = TransactionalStore::default();
        let counters: StoreMap<u64> = store.open_map("counters").await.unwrap();

        let mut tx = store.begin().await;
        tx.set(&counters, "a", &10).await.unwrap();
        tx.commit().await.unwrap();
        store.backup(dir.path().to_path_buf()).await.unwrap();

        let mut tx = store.begin().await;
        tx.set(&counters, "a", &6).await.unwrap();
        tx.commit().await.unwrap();

        let mut stale = store.begin().await;
        let current = stale.get_for_update(&counters, "a").await.unwrap().unwrap();
        stale.set(&counters, "a", &(current - 1)).await.unwrap();

        store.restore(dir.path(), RestorePolicy::Force).await.unwrap();
        let err = stale.commit().await.unwrap_err();
        assert!(matches!(err, InventoryError::ConflictOrTimeout(_)));
        assert_eq!(store.held_locks(), 0);

        let tx = store.begin().await;
        assert_eq!(tx.get(&counters, "a").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn restore_from_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        let store = TransactionalStore::default();
        let err = store.restore(dir.path(), RestorePolicy::Force).await.unwrap_err();
        assert!(matches!(err, InventoryError::RestoreFailure(_)));
    }
}
