//! Pluggable archival targets for completed store snapshots.
//!
//! Every backup is a directory of snapshot files plus a `manifest.json`
//! describing it. The manifest is written last, so a backup without one is
//! incomplete and ignored by listing and retention.

pub mod local;
pub mod remote;

pub use local::LocalBackupStore;
pub use remote::{HttpObjectStore, ObjectStore, RemoteBackupStore};

use crate::config::{BackupMode, BackupPolicy};
use crate::core::{InventoryError, Result, ShutdownSignal};
use crate::storage::{SnapshotInfo, SnapshotMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: SnapshotMetadata,
    /// Snapshot file names, relative to the backup directory.
    pub files: Vec<String>,
}

impl BackupManifest {
    pub(crate) fn new(snapshot: &SnapshotInfo, files: Vec<String>) -> Self {
        let created_at = Utc::now();
        Self {
            backup_id: format!("{}-{}", created_at.format("%Y%m%d-%H%M%S"), uuid::Uuid::new_v4()),
            created_at,
            snapshot: snapshot.metadata.clone(),
            files,
        }
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| InventoryError::SerializationError(format!("Failed to encode manifest: {}", e)))
    }

    pub(crate) fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| InventoryError::SerializationError(format!("Failed to decode manifest: {}", e)))
    }
}

/// An archived backup that can be restored from `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub backup_id: String,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Archives the snapshot under a fresh backup id and returns that id.
    async fn archive_backup(&self, snapshot: &SnapshotInfo, cancel: &ShutdownSignal) -> Result<String>;

    /// The most recent complete backup, made available on the local filesystem.
    async fn get_last_backup(&self, cancel: &ShutdownSignal) -> Result<Option<BackupRecord>>;

    /// Deletes all but the newest `max_to_keep` backups. Returns how many were deleted.
    async fn delete_backups(&self, max_to_keep: usize, cancel: &ShutdownSignal) -> Result<usize>;

    /// Complete backups, oldest first.
    async fn list_backups(&self, cancel: &ShutdownSignal) -> Result<Vec<BackupManifest>>;
}

/// Builds the backup store selected by configuration. `None` disables backups.
pub fn from_config(policy: &BackupPolicy) -> Result<Option<Arc<dyn BackupStore>>> {
    let store: Arc<dyn BackupStore> = match &policy.mode {
        BackupMode::None => return Ok(None),
        BackupMode::Local { root } => Arc::new(LocalBackupStore::new(root.clone())),
        BackupMode::Remote {
            endpoint,
            prefix,
            staging_dir,
            request_timeout_ms,
        } => {
            let objects = HttpObjectStore::new(endpoint, Duration::from_millis(*request_timeout_ms))?;
            Arc::new(RemoteBackupStore::new(objects, prefix.clone(), staging_dir.clone()))
        }
    };
    Ok(Some(store))
}

pub(crate) fn ensure_not_cancelled(cancel: &ShutdownSignal) -> Result<()> {
    if cancel.is_shutdown() {
        return Err(InventoryError::Cancelled);
    }
    Ok(())
}

/// Oldest first: creation time, then id.
pub(crate) fn sort_chronologically(manifests: &mut [BackupManifest]) {
    manifests.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.backup_id.cmp(&b.backup_id))
    });
}

/// Regular files directly inside a snapshot directory, sorted by name.
pub(crate) async fn snapshot_files(directory: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(directory).await.map_err(|e| {
        InventoryError::IoError(format!("Failed to read snapshot directory {}: {}", directory.display(), e))
    })?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| InventoryError::IoError(format!("Failed to read snapshot directory entry: {}", e)))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| InventoryError::IoError(format!("Failed to stat snapshot file: {}", e)))?;
        if file_type.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }
    }
    files.sort();
    Ok(files)
}
