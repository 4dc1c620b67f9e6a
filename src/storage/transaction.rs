use super::engine::{MapData, StoreInner, StoreState};
use super::map::{StoreMap, decode, encode};
use crate::core::{InventoryError, Result};
use crate::transaction::{LockKey, TransactionId, TransactionState};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A store transaction.
///
/// * `get`, `count` and `enumerate` read the snapshot taken at begin,
///   overlaid with this transaction's own pending writes.
/// * `get_for_update` and every write take the exclusive `(map, key)` lock
///   first and then see the latest committed value.
///
/// Dropping an active transaction aborts it and releases its locks.
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    inner: Arc<StoreInner>,
    snapshot: StoreState,
    epoch: u64,
    writes: BTreeMap<LockKey, Option<Vec<u8>>>,
    lock_timeout: Duration,
}

impl Transaction {
    pub(crate) fn new(
        inner: Arc<StoreInner>,
        snapshot: StoreState,
        epoch: u64,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            state: TransactionState::Active,
            inner,
            snapshot,
            epoch,
            writes: BTreeMap::new(),
            lock_timeout,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub async fn get<V: DeserializeOwned>(&self, map: &StoreMap<V>, key: &str) -> Result<Option<V>> {
        self.state.ensure_active(self.id, "get")?;
        if let Some(pending) = self.writes.get(&map.lock_key(key)) {
            return pending.as_deref().map(decode).transpose();
        }
        self.snapshot
            .get(map.name())
            .and_then(|data| data.get(key))
            .map(|bytes| decode(bytes))
            .transpose()
    }

    /// Locks `key` and reads its latest committed value.
    pub async fn get_for_update<V: DeserializeOwned>(
        &mut self,
        map: &StoreMap<V>,
        key: &str,
    ) -> Result<Option<V>> {
        self.state.ensure_active(self.id, "get_for_update")?;
        let lock_key = map.lock_key(key);
        self.lock(&lock_key, self.lock_timeout).await?;
        let current = self.read_latest(&lock_key).await;
        current.as_deref().map(decode).transpose()
    }

    pub async fn set<V: Serialize>(&mut self, map: &StoreMap<V>, key: &str, value: &V) -> Result<()> {
        self.state.ensure_active(self.id, "set")?;
        let lock_key = map.lock_key(key);
        self.lock(&lock_key, self.lock_timeout).await?;
        let bytes = encode(value)?;
        self.writes.insert(lock_key, Some(bytes));
        Ok(())
    }

    /// Removes `key` if present, returning the removed value.
    pub async fn try_remove<V: DeserializeOwned>(
        &mut self,
        map: &StoreMap<V>,
        key: &str,
    ) -> Result<Option<V>> {
        self.state.ensure_active(self.id, "try_remove")?;
        let lock_key = map.lock_key(key);
        self.lock(&lock_key, self.lock_timeout).await?;
        let previous = self.read_latest(&lock_key).await;
        if previous.is_some() {
            self.writes.insert(lock_key, None);
        }
        previous.as_deref().map(decode).transpose()
    }

    /// Writes `seed` if `key` is absent, otherwise `update(current)`. Waits at
    /// most `wait` for the key lock. Returns the value written.
    pub async fn add_or_update<V, F>(
        &mut self,
        map: &StoreMap<V>,
        key: &str,
        seed: V,
        update: F,
        wait: Duration,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(&V) -> V,
    {
        self.state.ensure_active(self.id, "add_or_update")?;
        let lock_key = map.lock_key(key);
        self.lock(&lock_key, wait).await?;
        let current = self.read_latest(&lock_key).await;
        let next = match current.as_deref().map(decode::<V>).transpose()? {
            Some(existing) => update(&existing),
            None => seed,
        };
        self.writes.insert(lock_key, Some(encode(&next)?));
        Ok(next)
    }

    pub async fn count<V>(&self, map: &StoreMap<V>) -> Result<usize> {
        self.state.ensure_active(self.id, "count")?;
        Ok(self.visible(map.name()).len())
    }

    /// All entries visible to this transaction, ordered by key.
    pub async fn enumerate<V: DeserializeOwned>(&self, map: &StoreMap<V>) -> Result<Vec<(String, V)>> {
        self.state.ensure_active(self.id, "enumerate")?;
        self.visible(map.name())
            .iter()
            .map(|(key, bytes)| Ok((key.clone(), decode(bytes)?)))
            .collect()
    }

    /// Applies every buffered write atomically and releases all locks.
    /// Returns the store's commit sequence after this transaction.
    ///
    /// Fails with `ConflictOrTimeout` if the store was restored after this
    /// transaction began and it has writes to apply.
    pub async fn commit(mut self) -> Result<u64> {
        self.state.ensure_active(self.id, "commit")?;
        let writes = std::mem::take(&mut self.writes);

        let commit_seq = {
            let mut committed = self.inner.committed.write().await;
            if !writes.is_empty() && committed.epoch != self.epoch {
                drop(committed);
                self.rollback();
                return Err(InventoryError::ConflictOrTimeout(format!(
                    "transaction {} began before a restore and cannot commit",
                    self.id
                )));
            }
            if !writes.is_empty() {
                for (lock_key, pending) in writes {
                    if !committed.state.contains_key(&lock_key.map) {
                        committed.state.insert(lock_key.map.clone(), MapData::new());
                    }
                    if let Some(data) = committed.state.get_mut(&lock_key.map) {
                        match pending {
                            Some(bytes) => {
                                data.insert(lock_key.key, bytes);
                            }
                            None => {
                                data.remove(&lock_key.key);
                            }
                        }
                    }
                }
                committed.commit_seq += 1;
            }
            committed.commit_seq
        };

        self.state = TransactionState::Committed;
        self.inner.locks.release_all(self.id);
        Ok(commit_seq)
    }

    /// Discards buffered writes and releases all locks.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.state.is_active() {
            self.writes.clear();
            self.state = TransactionState::Aborted;
            self.inner.locks.release_all(self.id);
        }
    }

    async fn lock(&self, lock_key: &LockKey, wait: Duration) -> Result<()> {
        self.inner.locks.acquire(lock_key, self.id, wait).await
    }

    async fn read_latest(&self, lock_key: &LockKey) -> Option<Vec<u8>> {
        if let Some(pending) = self.writes.get(lock_key) {
            return pending.clone();
        }
        let committed = self.inner.committed.read().await;
        committed
            .state
            .get(&lock_key.map)
            .and_then(|data| data.get(&lock_key.key))
            .cloned()
    }

    fn visible(&self, map_name: &str) -> MapData {
        let mut data = self.snapshot.get(map_name).cloned().unwrap_or_default();
        for (lock_key, pending) in &self.writes {
            if lock_key.map != map_name {
                continue;
            }
            match pending {
                Some(bytes) => {
                    data.insert(lock_key.key.clone(), bytes.clone());
                }
                None => {
                    data.remove(&lock_key.key);
                }
            }
        }
        data
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}
