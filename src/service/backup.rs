//! Backup lifecycle: periodic full snapshots, archival, retention and restore.
//!
//! ```text
//! Disabled                      (no backup store configured)
//! Idle -> InProgress -> Archiving -> [RetentionSweep] -> Idle
//! ```
//!
//! A pass leaves `InProgress` only when the store reports the snapshot done.
//! Archival and retention failures are logged and never stop the schedule;
//! restore failures always reach the caller.

use crate::backup_store::BackupStore;
use crate::config::BackupPolicy;
use crate::core::{InventoryError, Result, ShutdownSignal};
use crate::storage::{RestorePolicy, StoreMap, TransactionalStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

pub const BACKUP_COUNTER_MAP: &str = "backup-counter";
pub const BACKUP_COUNTER_KEY: &str = "completed-backups";

/// A retention sweep runs when the completed-backup count is a multiple of this.
pub const RETENTION_SWEEP_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Disabled,
    Idle,
    InProgress,
    Archiving,
    RetentionSweep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPassReport {
    /// Counter value after this backup.
    pub backup_number: u64,
    /// `None` when archival failed.
    pub backup_id: Option<String>,
    /// True when a retention sweep was requested, whether or not it succeeded.
    pub retention_swept: bool,
}

pub struct BackupLifecycle {
    store: TransactionalStore,
    backup_store: Option<Arc<dyn BackupStore>>,
    counter: StoreMap<u64>,
    policy: BackupPolicy,
    snapshot_dir: PathBuf,
    state_tx: watch::Sender<BackupState>,
}

impl BackupLifecycle {
    pub async fn open(
        store: TransactionalStore,
        backup_store: Option<Arc<dyn BackupStore>>,
        policy: BackupPolicy,
        snapshot_dir: PathBuf,
    ) -> Result<Self> {
        let counter = store.open_map(BACKUP_COUNTER_MAP).await?;
        let initial = if backup_store.is_some() {
            BackupState::Idle
        } else {
            BackupState::Disabled
        };
        let (state_tx, _) = watch::channel(initial);
        Ok(Self {
            store,
            backup_store,
            counter,
            policy,
            snapshot_dir,
            state_tx,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.backup_store.is_some()
    }

    pub fn state(&self) -> BackupState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BackupState> {
        self.state_tx.subscribe()
    }

    /// Number of backups completed so far, as recorded in the store.
    pub async fn completed_backups(&self) -> Result<u64> {
        let tx = self.store.begin().await;
        let count = tx.get(&self.counter, BACKUP_COUNTER_KEY).await?.unwrap_or(0);
        tx.commit().await?;
        Ok(count)
    }

    /// True when the configured backup store holds at least one complete backup.
    pub async fn has_archived_backups(&self, cancel: &ShutdownSignal) -> Result<bool> {
        match &self.backup_store {
            Some(backup_store) => Ok(!backup_store.list_backups(cancel).await?.is_empty()),
            None => Ok(false),
        }
    }

    /// Runs a backup pass every configured interval until shutdown.
    /// Returns immediately when backups are disabled.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let Some(backup_store) = &self.backup_store else {
            event!(Level::INFO, "backups disabled; backup loop not started");
            return;
        };
        let interval = self.policy.interval();
        event!(
            Level::INFO,
            kind = backup_store.kind(),
            interval_secs = interval.as_secs(),
            "backup loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    if shutdown.is_shutdown() {
                        break;
                    }
                    if let Err(err) = self.run_backup_pass(&shutdown).await {
                        event!(Level::WARN, error = %err, "backup pass failed");
                    }
                }
            }
        }
        event!(Level::INFO, "backup loop stopped");
    }

    /// Takes one snapshot and drives it through archival and, every
    /// `RETENTION_SWEEP_EVERY` backups, a retention sweep.
    ///
    /// Fails only when the snapshot itself or the counter update fails.
    pub async fn run_backup_pass(&self, cancel: &ShutdownSignal) -> Result<BackupPassReport> {
        let backup_store = self
            .backup_store
            .clone()
            .ok_or_else(|| InventoryError::ConfigError("backups are disabled".to_string()))?;
        if cancel.is_shutdown() {
            return Err(InventoryError::Cancelled);
        }

        let span = info_span!("backup.pass", kind = backup_store.kind());
        self.set_state(BackupState::InProgress);
        let result = self.backup_pass(backup_store.as_ref(), cancel).instrument(span).await;
        self.set_state(BackupState::Idle);
        result
    }

    async fn backup_pass(&self, backup_store: &dyn BackupStore, cancel: &ShutdownSignal) -> Result<BackupPassReport> {
        let done = self.store.begin_backup(self.snapshot_dir.clone()).await;
        let snapshot = done
            .await
            .map_err(|_| InventoryError::IoError("snapshot writer dropped its completion channel".into()))??;

        self.set_state(BackupState::Archiving);
        let backup_number = self.increment_counter().await?;

        let backup_id = match backup_store.archive_backup(&snapshot, cancel).await {
            Ok(backup_id) => {
                event!(
                    Level::INFO,
                    backup_number,
                    backup_id = %backup_id,
                    commit_seq = snapshot.metadata.commit_seq,
                    "backup archived"
                );
                Some(backup_id)
            }
            Err(err) => {
                let err = InventoryError::ArchivalFailure(err.to_string());
                event!(Level::WARN, backup_number, error = %err, "backup archival failed");
                None
            }
        };

        let retention_swept = backup_number % RETENTION_SWEEP_EVERY == 0;
        if retention_swept {
            self.set_state(BackupState::RetentionSweep);
            let max_to_keep = self.policy.max_backups_to_keep;
            match backup_store.delete_backups(max_to_keep, cancel).await {
                Ok(deleted) => event!(Level::INFO, max_to_keep, deleted, "backup retention sweep finished"),
                Err(err) => {
                    let err = InventoryError::RetentionFailure(err.to_string());
                    event!(Level::WARN, max_to_keep, error = %err, "backup retention sweep failed");
                }
            }
        }

        Ok(BackupPassReport {
            backup_number,
            backup_id,
            retention_swept,
        })
    }

    async fn increment_counter(&self) -> Result<u64> {
        let mut tx = self.store.begin().await;
        let count = tx
            .add_or_update(
                &self.counter,
                BACKUP_COUNTER_KEY,
                1,
                |count| count + 1,
                self.policy.counter_timeout(),
            )
            .await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Restore path for detected data loss.
    ///
    /// Returns `false` when backups are disabled and the current state is kept,
    /// `true` after the full state was overwritten from the latest backup. Any
    /// failure is returned unchanged; the caller must not keep serving.
    pub async fn restore_on_data_loss(&self, cancel: &ShutdownSignal) -> Result<bool> {
        let Some(backup_store) = &self.backup_store else {
            event!(Level::INFO, "no backup store configured; keeping current state");
            return Ok(false);
        };

        let span = info_span!("backup.restore", kind = backup_store.kind());
        async {
            let restored: Result<bool> = async {
                let record = backup_store.get_last_backup(cancel).await?.ok_or_else(|| {
                    InventoryError::RestoreFailure("no archived backup available".to_string())
                })?;
                let metadata = self.store.restore(&record.location, RestorePolicy::Force).await?;
                event!(
                    Level::INFO,
                    backup_id = %record.backup_id,
                    commit_seq = metadata.commit_seq,
                    "state restored from backup"
                );
                Ok(true)
            }
            .await;

            if let Err(err) = &restored {
                event!(Level::ERROR, error = %err, "restore failed");
            }
            restored
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, state: BackupState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_lifecycle_keeps_state() {
        let store = TransactionalStore::default();
        let lifecycle = BackupLifecycle::open(store, None, BackupPolicy::default(), PathBuf::from("unused"))
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), BackupState::Disabled);
        assert!(!lifecycle.restore_on_data_loss(&ShutdownSignal::never()).await.unwrap());
        assert!(lifecycle.run_backup_pass(&ShutdownSignal::never()).await.is_err());

        // Returns at once instead of looping.
        lifecycle.run(ShutdownSignal::never()).await;
    }
}
