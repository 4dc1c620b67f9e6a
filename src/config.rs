use crate::core::{InventoryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "STOCKROOM_CONFIG";

/// Where periodic backups are archived. Chosen once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupMode {
    /// Backups disabled; restore keeps the current state.
    #[default]
    None,
    /// Archive into directories under `root`.
    Local { root: PathBuf },
    /// Archive into a remote object store.
    Remote {
        endpoint: String,
        #[serde(default = "default_remote_prefix")]
        prefix: String,
        /// Local directory remote backups are downloaded into before restore.
        staging_dir: PathBuf,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
}

fn default_remote_prefix() -> String {
    "stockroom-backups".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Backup lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    pub mode: BackupMode,
    /// Minutes between full snapshots.
    pub interval_minutes: u64,
    /// Archived backups kept by each retention sweep.
    pub max_backups_to_keep: usize,
    /// Bound on the wait for the backup counter lock.
    pub counter_timeout_ms: u64,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            mode: BackupMode::None,
            interval_minutes: 30,
            max_backups_to_keep: 10,
            counter_timeout_ms: 4_000,
        }
    }
}

impl BackupPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn counter_timeout(&self) -> Duration {
        Duration::from_millis(self.counter_timeout_ms)
    }
}

/// Downstream restock service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestockPolicy {
    /// Base URL of the restock service; `None` leaves the client to the embedder.
    pub base_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for RestockPolicy {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Service configuration, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Working directory; snapshots are staged under `<data_dir>/snapshots`.
    pub data_dir: PathBuf,
    pub lock_timeout_ms: u64,
    pub reconciliation_interval_ms: u64,
    pub trim_interval_ms: u64,
    pub dedup_retention_ms: u64,
    pub backup: BackupPolicy,
    pub restock: RestockPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("stockroom-data"),
            lock_timeout_ms: 4_000,
            reconciliation_interval_ms: 30_000,
            trim_interval_ms: 5 * 60_000,
            dedup_retention_ms: 2 * 60 * 60_000,
            backup: BackupPolicy::default(),
            restock: RestockPolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InventoryError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| InventoryError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validated()
    }

    /// Loads the file named by `STOCKROOM_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_json_file(PathBuf::from(path)),
            None => Self::default().validated(),
        }
    }

    /// Clamps intervals to usable minimums and rejects unusable backup modes.
    pub fn validated(mut self) -> Result<Self> {
        self.lock_timeout_ms = self.lock_timeout_ms.max(1);
        self.reconciliation_interval_ms = self.reconciliation_interval_ms.max(10);
        self.trim_interval_ms = self.trim_interval_ms.max(10);
        self.backup.interval_minutes = self.backup.interval_minutes.max(1);
        self.backup.max_backups_to_keep = self.backup.max_backups_to_keep.max(1);
        self.backup.counter_timeout_ms = self.backup.counter_timeout_ms.max(1);

        if let BackupMode::Remote { endpoint, .. } = &self.backup.mode {
            if endpoint.trim().is_empty() {
                return Err(InventoryError::ConfigError(
                    "backup.mode.endpoint must not be empty for remote backups".to_string(),
                ));
            }
        }
        Ok(self)
    }

    pub fn data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn backup_mode(mut self, mode: BackupMode) -> Self {
        self.backup.mode = mode;
        self
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_millis(self.dedup_retention_ms)
    }
}
