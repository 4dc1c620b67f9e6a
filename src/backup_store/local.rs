use super::{
    BackupManifest, BackupRecord, BackupStore, MANIFEST_FILE_NAME, ensure_not_cancelled,
    snapshot_files, sort_chronologically,
};
use crate::core::{InventoryError, Result, ShutdownSignal};
use crate::storage::SnapshotInfo;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{Level, event};

/// Archives backups as `root/<backup_id>/` directories.
pub struct LocalBackupStore {
    root: PathBuf,
}

impl LocalBackupStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Copies the snapshot files into `root/<backup_id>/`, manifest last.
    /// Removes the directory again if any step fails.
    async fn store_backup(&self, source: &Path, manifest: &BackupManifest, cancel: &ShutdownSignal) -> Result<()> {
        let target = self.root.join(&manifest.backup_id);
        let Err(err) = write_backup(source, &target, manifest, cancel).await else {
            return Ok(());
        };
        // Without a manifest the directory is never listed, so retention would never remove it.
        if let Err(cleanup) = fs::remove_dir_all(&target).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                event!(
                    Level::WARN,
                    path = %target.display(),
                    error = %cleanup,
                    "failed to remove incomplete backup"
                );
            }
        }
        Err(err)
    }

    async fn read_manifests(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => {
                return Err(InventoryError::IoError(format!(
                    "Failed to read backup root {}: {}",
                    self.root.display(),
                    e
                )));
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| InventoryError::IoError(format!("Failed to read backup entry: {}", e)))?
        {
            let manifest_path = entry.path().join(MANIFEST_FILE_NAME);
            let bytes = match fs::read(&manifest_path).await {
                Ok(bytes) => bytes,
                // Incomplete backup or unrelated entry.
                Err(_) => continue,
            };
            match BackupManifest::from_json(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => event!(
                    Level::WARN,
                    path = %manifest_path.display(),
                    error = %e,
                    "skipping unreadable backup manifest"
                ),
            }
        }

        sort_chronologically(&mut manifests);
        Ok(manifests)
    }
}

async fn write_backup(
    source: &Path,
    target: &Path,
    manifest: &BackupManifest,
    cancel: &ShutdownSignal,
) -> Result<()> {
    fs::create_dir_all(target)
        .await
        .map_err(|e| InventoryError::IoError(format!("Failed to create {}: {}", target.display(), e)))?;
    for file in &manifest.files {
        ensure_not_cancelled(cancel)?;
        fs::copy(source.join(file), target.join(file))
            .await
            .map_err(|e| InventoryError::IoError(format!("Failed to copy {}: {}", file, e)))?;
    }
    fs::write(target.join(MANIFEST_FILE_NAME), manifest.to_json()?)
        .await
        .map_err(|e| InventoryError::IoError(format!("Failed to write manifest: {}", e)))
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn archive_backup(&self, snapshot: &SnapshotInfo, cancel: &ShutdownSignal) -> Result<String> {
        ensure_not_cancelled(cancel)?;
        let files = snapshot_files(&snapshot.directory).await?;
        let manifest = BackupManifest::new(snapshot, files);
        self.store_backup(&snapshot.directory, &manifest, cancel).await?;

        event!(
            Level::DEBUG,
            backup_id = %manifest.backup_id,
            files = manifest.files.len(),
            "backup archived locally"
        );
        Ok(manifest.backup_id)
    }

    async fn get_last_backup(&self, cancel: &ShutdownSignal) -> Result<Option<BackupRecord>> {
        ensure_not_cancelled(cancel)?;
        Ok(self.read_manifests().await?.pop().map(|manifest| BackupRecord {
            location: self.root.join(&manifest.backup_id),
            backup_id: manifest.backup_id,
            created_at: manifest.created_at,
        }))
    }

    async fn delete_backups(&self, max_to_keep: usize, cancel: &ShutdownSignal) -> Result<usize> {
        ensure_not_cancelled(cancel)?;
        let manifests = self.read_manifests().await?;
        let excess = manifests.len().saturating_sub(max_to_keep);

        for manifest in manifests.iter().take(excess) {
            ensure_not_cancelled(cancel)?;
            let path = self.root.join(&manifest.backup_id);
            fs::remove_dir_all(&path)
                .await
                .map_err(|e| InventoryError::IoError(format!("Failed to delete {}: {}", path.display(), e)))?;
        }
        Ok(excess)
    }

    async fn list_backups(&self, cancel: &ShutdownSignal) -> Result<Vec<BackupManifest>> {
        ensure_not_cancelled(cancel)?;
        self.read_manifests().await
    }
}
