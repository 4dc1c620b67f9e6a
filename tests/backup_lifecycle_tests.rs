use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use stockroom::backup_store::BackupManifest;
use stockroom::storage::SnapshotInfo;
use stockroom::{
    BackupLifecycle, BackupMode, BackupPolicy, BackupRecord, BackupState, BackupStore,
    InventoryError, InventoryItem, ItemId, LocalBackupStore, Result, ShutdownSignal, StockLedger,
    TransactionalStore,
};
use tempfile::TempDir;
use tokio::sync::watch;

/// Backup store double that records every call and the lifecycle state seen during it.
#[derive(Default)]
struct ScriptedStore {
    fail_archive: bool,
    fail_last_backup: bool,
    archived: Mutex<Vec<String>>,
    sweeps: Mutex<Vec<usize>>,
    states: Mutex<Vec<BackupState>>,
    lifecycle_state: OnceLock<watch::Receiver<BackupState>>,
}

impl ScriptedStore {
    fn observe(&self) {
        if let Some(rx) = self.lifecycle_state.get() {
            self.states.lock().unwrap().push(*rx.borrow());
        }
    }
}

#[async_trait]
impl BackupStore for ScriptedStore {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn archive_backup(&self, snapshot: &SnapshotInfo, _cancel: &ShutdownSignal) -> Result<String> {
        self.observe();
        if self.fail_archive {
            return Err(InventoryError::IoError("remote unreachable".into()));
        }
        let id = format!("backup-{}", snapshot.metadata.snapshot_id);
        self.archived.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn get_last_backup(&self, _cancel: &ShutdownSignal) -> Result<Option<BackupRecord>> {
        if self.fail_last_backup {
            return Err(InventoryError::IoError("disk gone".into()));
        }
        Ok(None)
    }

    async fn delete_backups(&self, max_to_keep: usize, _cancel: &ShutdownSignal) -> Result<usize> {
        self.observe();
        self.sweeps.lock().unwrap().push(max_to_keep);
        Ok(0)
    }

    async fn list_backups(&self, _cancel: &ShutdownSignal) -> Result<Vec<BackupManifest>> {
        Ok(Vec::new())
    }
}

async fn lifecycle_with(
    store: TransactionalStore,
    backup_store: Arc<dyn BackupStore>,
    policy: BackupPolicy,
    snapshots: &TempDir,
) -> BackupLifecycle {
    BackupLifecycle::open(store, Some(backup_store), policy, snapshots.path().to_path_buf())
        .await
        .unwrap()
}

async fn run_passes(lifecycle: &BackupLifecycle, passes: usize) {
    let never = ShutdownSignal::never();
    for _ in 0..passes {
        lifecycle.run_backup_pass(&never).await.unwrap();
    }
}

#[tokio::test]
async fn ninth_backup_does_not_sweep() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore::default());
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted.clone(),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    run_passes(&lifecycle, 9).await;
    assert!(scripted.sweeps.lock().unwrap().is_empty());
    assert_eq!(scripted.archived.lock().unwrap().len(), 9);
    assert_eq!(lifecycle.completed_backups().await.unwrap(), 9);
}

#[tokio::test]
async fn tenth_backup_sweeps_exactly_once() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore::default());
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted.clone(),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    run_passes(&lifecycle, 9).await;
    let report = lifecycle.run_backup_pass(&ShutdownSignal::never()).await.unwrap();
    assert_eq!(report.backup_number, 10);
    assert!(report.retention_swept);
    assert_eq!(*scripted.sweeps.lock().unwrap(), vec![10]);

    run_passes(&lifecycle, 9).await;
    assert_eq!(*scripted.sweeps.lock().unwrap(), vec![10]);
    run_passes(&lifecycle, 1).await;
    assert_eq!(*scripted.sweeps.lock().unwrap(), vec![10, 10]);
}

#[tokio::test]
async fn states_follow_the_pass() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore::default());
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted.clone(),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;
    scripted.lifecycle_state.set(lifecycle.subscribe_state()).unwrap();
    assert_eq!(lifecycle.state(), BackupState::Idle);

    run_passes(&lifecycle, 10).await;
    let states = scripted.states.lock().unwrap().clone();
    assert_eq!(states.len(), 11);
    assert!(states[..10].iter().all(|state| *state == BackupState::Archiving));
    assert_eq!(states[10], BackupState::RetentionSweep);
    assert_eq!(lifecycle.state(), BackupState::Idle);
}

#[tokio::test]
async fn archival_failure_does_not_stop_backups() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore {
        fail_archive: true,
        ..ScriptedStore::default()
    });
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted.clone(),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    let never = ShutdownSignal::never();
    for expected in 1..=10u64 {
        let report = lifecycle.run_backup_pass(&never).await.unwrap();
        assert_eq!(report.backup_number, expected);
        assert!(report.backup_id.is_none());
    }
    assert_eq!(*scripted.sweeps.lock().unwrap(), vec![10]);
}

#[tokio::test]
async fn cancelled_pass_does_nothing() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore::default());
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted.clone(),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    let (trigger, signal) = stockroom::shutdown_channel();
    trigger.trigger();
    let err = lifecycle.run_backup_pass(&signal).await.unwrap_err();
    assert!(matches!(err, InventoryError::Cancelled));
    assert_eq!(lifecycle.completed_backups().await.unwrap(), 0);
}

#[tokio::test]
async fn restore_without_backups_configured_keeps_state() {
    let lifecycle = BackupLifecycle::open(
        TransactionalStore::default(),
        None,
        BackupPolicy::default(),
        PathBuf::from("unused"),
    )
    .await
    .unwrap();
    assert_eq!(lifecycle.state(), BackupState::Disabled);
    assert!(!lifecycle.restore_on_data_loss(&ShutdownSignal::never()).await.unwrap());
}

#[tokio::test]
async fn restore_error_reaches_the_caller_unchanged() {
    let snapshots = TempDir::new().unwrap();
    let scripted = Arc::new(ScriptedStore {
        fail_last_backup: true,
        ..ScriptedStore::default()
    });
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        scripted,
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    let err = lifecycle
        .restore_on_data_loss(&ShutdownSignal::never())
        .await
        .unwrap_err();
    match err {
        InventoryError::IoError(message) => assert_eq!(message, "disk gone"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn restore_with_empty_backup_store_fails() {
    let snapshots = TempDir::new().unwrap();
    let lifecycle = lifecycle_with(
        TransactionalStore::default(),
        Arc::new(ScriptedStore::default()),
        BackupPolicy::default(),
        &snapshots,
    )
    .await;

    let err = lifecycle
        .restore_on_data_loss(&ShutdownSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::RestoreFailure(_)));
}

#[tokio::test]
async fn local_backup_restores_lost_state() {
    let snapshots = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let store = TransactionalStore::default();
    let ledger = StockLedger::open(store.clone()).await.unwrap();
    ledger
        .create_item(InventoryItem::new("lamp", "desk lamp", 24.0, 6, 2, 12))
        .await
        .unwrap();

    let local = Arc::new(LocalBackupStore::new(archive.path().to_path_buf()));
    let lifecycle = lifecycle_with(store, local, BackupPolicy::default(), &snapshots).await;
    let report = lifecycle.run_backup_pass(&ShutdownSignal::never()).await.unwrap();
    assert!(report.backup_id.is_some());

    // Lose state after the backup.
    ledger.debug_delete_item(&ItemId::new("lamp")).await.unwrap();
    ledger
        .create_item(InventoryItem::new("chair", "office chair", 120.0, 1, 1, 4))
        .await
        .unwrap();

    assert!(lifecycle.restore_on_data_loss(&ShutdownSignal::never()).await.unwrap());
    assert!(ledger.exists(&ItemId::new("lamp")).await.unwrap());
    assert!(!ledger.exists(&ItemId::new("chair")).await.unwrap());
}

#[tokio::test]
async fn local_retention_keeps_newest_backups() {
    let snapshots = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let local = Arc::new(LocalBackupStore::new(archive.path().to_path_buf()));
    let policy = BackupPolicy {
        mode: BackupMode::Local {
            root: archive.path().to_path_buf(),
        },
        max_backups_to_keep: 3,
        ..BackupPolicy::default()
    };
    let lifecycle = lifecycle_with(TransactionalStore::default(), local.clone(), policy, &snapshots).await;
    let never = ShutdownSignal::never();

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(lifecycle.run_backup_pass(&never).await.unwrap().backup_id.unwrap());
    }

    let kept: Vec<String> = local
        .list_backups(&never)
        .await
        .unwrap()
        .into_iter()
        .map(|manifest| manifest.backup_id)
        .collect();
    assert_eq!(kept, ids[7..].to_vec());

    lifecycle.run_backup_pass(&never).await.unwrap();
    assert_eq!(local.list_backups(&never).await.unwrap().len(), 4);
}

#[tokio::test]
async fn writer_begun_before_restore_is_rejected() {
    let snapshots = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    let store = TransactionalStore::default();
    let ledger = StockLedger::open(store.clone()).await.unwrap();
    let id = ItemId::new("valve");
    ledger
        .create_item(InventoryItem::new("valve", "brass valve", 9.0, 10, 2, 20))
        .await
        .unwrap();

    let local = Arc::new(LocalBackupStore::new(archive.path().to_path_buf()));
    let lifecycle = lifecycle_with(store.clone(), local, BackupPolicy::default(), &snapshots).await;
    lifecycle.run_backup_pass(&ShutdownSignal::never()).await.unwrap();

    let order = stockroom::RequestId::new("order-1");
    assert_eq!(ledger.remove_stock(&id, 4, &order).await.unwrap(), 4);

    let mut in_flight = store.begin().await;
    let mut item = in_flight.get_for_update(ledger.items(), id.as_str()).await.unwrap().unwrap();
    item.available_stock -= 1;
    in_flight.set(ledger.items(), id.as_str(), &item).await.unwrap();

    assert!(lifecycle.restore_on_data_loss(&ShutdownSignal::never()).await.unwrap());
    let err = in_flight.commit().await.unwrap_err();
    assert!(matches!(err, InventoryError::ConflictOrTimeout(_)));

    let restored = ledger.get_item(&id).await.unwrap().unwrap();
    assert_eq!(restored.available_stock, 10);
    // The restored history has no record of order-1, so its retry applies once.
    assert_eq!(ledger.remove_stock(&id, 4, &order).await.unwrap(), 4);
    assert_eq!(ledger.get_item(&id).await.unwrap().unwrap().available_stock, 6);
}
