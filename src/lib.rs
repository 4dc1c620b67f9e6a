// ============================================================================
// Stockroom Library
// ============================================================================

pub mod backup_store;
pub mod config;
pub mod core;
pub mod inventory;
pub mod restock;
pub mod service;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{
    InventoryError, InventoryItem, InventoryItemView, ItemId, RequestId, RequestRecord, Result,
    ShutdownSignal, ShutdownTrigger, TransientFault, shutdown_channel,
};
pub use backup_store::{BackupRecord, BackupStore, LocalBackupStore, RemoteBackupStore};
pub use config::{BackupMode, BackupPolicy, RestockPolicy, ServiceConfig};
pub use inventory::StockLedger;
pub use restock::{HttpRestockClient, RestockClient, RestockRequest};
pub use service::{
    BackupLifecycle, BackupPassReport, BackupState, HistoryTrimmer, InventoryService,
    ReconcileReport, Reconciler, ServiceHandle, TrimReport,
};
pub use storage::{RestorePolicy, StoreMap, Transaction, TransactionalStore};
