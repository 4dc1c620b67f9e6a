//! Service wiring: one store, the ledger, and the three background loops.

pub mod backup;
pub mod reconcile;
pub mod trimming;

pub use backup::{BackupLifecycle, BackupPassReport, BackupState, RETENTION_SWEEP_EVERY};
pub use reconcile::{ReconcileReport, Reconciler};
pub use trimming::{DEFAULT_DEDUP_RETENTION, HistoryTrimmer, TrimReport};

use crate::backup_store;
use crate::config::ServiceConfig;
use crate::core::{InventoryError, Result, ShutdownSignal, ShutdownTrigger, shutdown_channel};
use crate::inventory::StockLedger;
use crate::restock::RestockClient;
use crate::storage::TransactionalStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// A fully wired, not yet running inventory service.
pub struct InventoryService {
    ledger: StockLedger,
    reconciler: Arc<Reconciler>,
    trimmer: Arc<HistoryTrimmer>,
    backup: Arc<BackupLifecycle>,
}

impl InventoryService {
    pub async fn open(config: &ServiceConfig, restock_client: Arc<dyn RestockClient>) -> Result<Self> {
        let store = TransactionalStore::new(config.lock_timeout());
        let ledger = StockLedger::open(store.clone()).await?;
        let backup_store = backup_store::from_config(&config.backup)?;

        let reconciler = Reconciler::new(&ledger, restock_client, config.reconciliation_interval());
        let trimmer = HistoryTrimmer::new(&ledger, config.dedup_retention(), config.trim_interval());
        let backup = BackupLifecycle::open(
            store,
            backup_store,
            config.backup.clone(),
            config.snapshot_dir(),
        )
        .await?;

        Ok(Self {
            ledger,
            reconciler: Arc::new(reconciler),
            trimmer: Arc::new(trimmer),
            backup: Arc::new(backup),
        })
    }

    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn backup(&self) -> &Arc<BackupLifecycle> {
        &self.backup
    }

    /// Spawns the reconciliation, trimming and backup loops.
    pub fn start(self) -> ServiceHandle {
        let (trigger, signal) = shutdown_channel();

        let reconciler = self.reconciler.clone();
        let reconcile_signal = signal.clone();
        let trimmer = self.trimmer.clone();
        let trim_signal = signal.clone();
        let backup = self.backup.clone();
        let backup_signal = signal.clone();

        let tasks = vec![
            tokio::spawn(async move { reconciler.run(reconcile_signal).await }),
            tokio::spawn(async move { trimmer.run(trim_signal).await }),
            tokio::spawn(async move { backup.run(backup_signal).await }),
        ];
        event!(Level::INFO, backups_enabled = self.backup.is_enabled(), "inventory service started");

        ServiceHandle {
            ledger: self.ledger,
            backup: self.backup,
            trigger,
            signal,
            tasks,
        }
    }
}

/// Handle to a running service. Dropping it without `shutdown` aborts the loops.
pub struct ServiceHandle {
    ledger: StockLedger,
    backup: Arc<BackupLifecycle>,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    pub fn backup(&self) -> &Arc<BackupLifecycle> {
        &self.backup
    }

    /// The service-wide shutdown signal, for passing to restore.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Fires the shutdown signal and waits for every loop to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.trigger.trigger();
        let tasks = std::mem::take(&mut self.tasks);
        for outcome in futures::future::join_all(tasks).await {
            outcome.map_err(|e| InventoryError::IoError(format!("service loop join: {}", e)))?;
        }
        event!(Level::INFO, "inventory service stopped");
        Ok(())
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.trigger.trigger();
        for task in &self.tasks {
            task.abort();
        }
    }
}
