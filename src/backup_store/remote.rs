use super::{
    BackupManifest, BackupRecord, BackupStore, MANIFEST_FILE_NAME, ensure_not_cancelled,
    snapshot_files, sort_chronologically,
};
use crate::core::{InventoryError, Result, ShutdownSignal};
use crate::storage::SnapshotInfo;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{Level, event};

/// Flat byte-object transport behind the remote backup store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Keys starting with `prefix`, in any order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Archives backups as objects under `<prefix>/<backup_id>/<file>`.
///
/// Restores are served from `staging_dir/<backup_id>/`, downloaded on demand.
pub struct RemoteBackupStore<O: ObjectStore> {
    objects: O,
    prefix: String,
    staging_dir: PathBuf,
}

impl<O: ObjectStore> RemoteBackupStore<O> {
    pub fn new(objects: O, prefix: impl Into<String>, staging_dir: PathBuf) -> Self {
        Self {
            objects,
            prefix: prefix.into().trim_matches('/').to_string(),
            staging_dir,
        }
    }

    fn object_key(&self, backup_id: &str, file: &str) -> String {
        format!("{}/{}/{}", self.prefix, backup_id, file)
    }

    async fn read_manifests(&self) -> Result<Vec<BackupManifest>> {
        let suffix = format!("/{}", MANIFEST_FILE_NAME);
        let mut manifests = Vec::new();
        for key in self.objects.list(&format!("{}/", self.prefix)).await? {
            if !key.ends_with(&suffix) {
                continue;
            }
            let Some(bytes) = self.objects.get(&key).await? else {
                continue;
            };
            match BackupManifest::from_json(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => event!(Level::WARN, key = %key, error = %e, "skipping unreadable backup manifest"),
            }
        }
        sort_chronologically(&mut manifests);
        Ok(manifests)
    }

    async fn download(&self, manifest: &BackupManifest, cancel: &ShutdownSignal) -> Result<PathBuf> {
        let target = self.staging_dir.join(&manifest.backup_id);
        fs::create_dir_all(&target)
            .await
            .map_err(|e| InventoryError::IoError(format!("Failed to create {}: {}", target.display(), e)))?;

        for file in &manifest.files {
            ensure_not_cancelled(cancel)?;
            let key = self.object_key(&manifest.backup_id, file);
            let bytes = self.objects.get(&key).await?.ok_or_else(|| {
                InventoryError::NotFound(format!("backup object {}", key))
            })?;
            fs::write(target.join(file), bytes)
                .await
                .map_err(|e| InventoryError::IoError(format!("Failed to stage {}: {}", file, e)))?;
        }
        self.prune_staging(&manifest.backup_id).await;
        Ok(target)
    }

    /// Drops every staged backup except `keep`. Failures only cost disk space.
    async fn prune_staging(&self, keep: &str) {
        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                event!(Level::WARN, dir = %self.staging_dir.display(), error = %e, "cannot list staged backups");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_str() == Some(keep) {
                continue;
            }
            let path = entry.path();
            if let Err(e) = fs::remove_dir_all(&path).await {
                event!(Level::WARN, path = %path.display(), error = %e, "failed to remove stale staged backup");
            }
        }
    }
}

#[async_trait]
impl<O: ObjectStore> BackupStore for RemoteBackupStore<O> {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn archive_backup(&self, snapshot: &SnapshotInfo, cancel: &ShutdownSignal) -> Result<String> {
        ensure_not_cancelled(cancel)?;
        let files = snapshot_files(&snapshot.directory).await?;
        let manifest = BackupManifest::new(snapshot, files);

        for file in &manifest.files {
            ensure_not_cancelled(cancel)?;
            let bytes = fs::read(snapshot.directory.join(file))
                .await
                .map_err(|e| InventoryError::IoError(format!("Failed to read {}: {}", file, e)))?;
            self.objects
                .put(&self.object_key(&manifest.backup_id, file), bytes)
                .await?;
        }
        self.objects
            .put(&self.object_key(&manifest.backup_id, MANIFEST_FILE_NAME), manifest.to_json()?)
            .await?;

        event!(
            Level::DEBUG,
            backup_id = %manifest.backup_id,
            files = manifest.files.len(),
            "backup uploaded"
        );
        Ok(manifest.backup_id)
    }

    async fn get_last_backup(&self, cancel: &ShutdownSignal) -> Result<Option<BackupRecord>> {
        ensure_not_cancelled(cancel)?;
        let Some(manifest) = self.read_manifests().await?.pop() else {
            return Ok(None);
        };
        let location = self.download(&manifest, cancel).await?;
        Ok(Some(BackupRecord {
            backup_id: manifest.backup_id,
            location,
            created_at: manifest.created_at,
        }))
    }

    async fn delete_backups(&self, max_to_keep: usize, cancel: &ShutdownSignal) -> Result<usize> {
        ensure_not_cancelled(cancel)?;
        let manifests = self.read_manifests().await?;
        let excess = manifests.len().saturating_sub(max_to_keep);

        for manifest in manifests.iter().take(excess) {
            ensure_not_cancelled(cancel)?;
            // Manifest first, so a partially deleted backup is no longer listed.
            self.objects
                .delete(&self.object_key(&manifest.backup_id, MANIFEST_FILE_NAME))
                .await?;
            for file in &manifest.files {
                self.objects.delete(&self.object_key(&manifest.backup_id, file)).await?;
            }
        }
        Ok(excess)
    }

    async fn list_backups(&self, cancel: &ShutdownSignal) -> Result<Vec<BackupManifest>> {
        ensure_not_cancelled(cancel)?;
        self.read_manifests().await
    }
}

/// `ObjectStore` over plain HTTP: `PUT`/`GET`/`DELETE {endpoint}/{key}` and
/// `GET {endpoint}?prefix=...` answering with a JSON array of keys.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InventoryError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }
}

fn transport_error(op: &str, key: &str, err: reqwest::Error) -> InventoryError {
    InventoryError::IoError(format!("object store {} {} failed: {}", op, key, err))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put(self.url(key))
            .body(bytes)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| transport_error("PUT", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(|e| transport_error("GET", key, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .map_err(|e| transport_error("GET", key, e))?
            .bytes()
            .await
            .map_err(|e| transport_error("GET", key, e))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.client
            .get(&self.endpoint)
            .query(&[("prefix", prefix)])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| transport_error("LIST", prefix, e))?
            .json::<Vec<String>>()
            .await
            .map_err(|e| transport_error("LIST", prefix, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(key))
            .send()
            .await
            .map_err(|e| transport_error("DELETE", key, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(|e| transport_error("DELETE", key, e))?;
        Ok(())
    }
}
