//! Full-state snapshot files used by the backup and restore primitives

use crate::core::{InventoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const SNAPSHOT_FILE_NAME: &str = "store.snapshot";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Encoded map contents: map name -> key -> encoded value.
pub type SnapshotMaps = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub metadata: SnapshotMetadata,
    pub maps: SnapshotMaps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub commit_seq: u64,
    pub map_count: usize,
    pub entry_count: usize,
}

impl StoreSnapshot {
    pub fn new(maps: SnapshotMaps, commit_seq: u64) -> Self {
        let entry_count = maps.values().map(BTreeMap::len).sum();
        let map_count = maps.len();

        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            metadata: SnapshotMetadata {
                snapshot_id: uuid::Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                commit_seq,
                map_count,
                entry_count,
            },
            maps,
        }
    }
}

/// A completed snapshot: the directory holding its files plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub directory: PathBuf,
    pub metadata: SnapshotMetadata,
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn in_directory<P: AsRef<Path>>(directory: P) -> Self {
        Self::new(directory.as_ref().join(SNAPSHOT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Writes the snapshot atomically (temp file in the same directory, then rename).
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = self
            .snapshot_path
            .parent()
            .ok_or_else(|| InventoryError::IoError("Snapshot path has no parent directory".to_string()))?;
        fs::create_dir_all(parent).map_err(|e| InventoryError::IoError(format!("Failed to create snapshot directory: {}", e)))?;

        let serialized = rmp_serde::to_vec_named(snapshot).map_err(|e| InventoryError::SerializationError(format!("Failed to serialize snapshot: {}", e)))?;
        let mut temp = NamedTempFile::new_in(parent).map_err(|e| InventoryError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized).map_err(|e| InventoryError::IoError(format!("Failed to write snapshot: {}", e)))?;
        temp.flush().map_err(|e| InventoryError::IoError(format!("Failed to flush snapshot: {}", e)))?;
        temp.as_file().sync_all().map_err(|e| InventoryError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path).map_err(|e| InventoryError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() { return Ok(None); }
        let mut file = File::open(&self.snapshot_path).map_err(|e| InventoryError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| InventoryError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| InventoryError::SerializationError(format!("Failed to deserialize snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(InventoryError::SerializationError(format!(
                "Unsupported snapshot format version {} (expected {})",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}
