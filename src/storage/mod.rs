pub mod engine;
pub mod map;
pub mod snapshot;
pub mod transaction;

pub use engine::{DEFAULT_LOCK_TIMEOUT, RestorePolicy, TransactionalStore};
pub use map::StoreMap;
pub use snapshot::{SnapshotInfo, SnapshotManager, SnapshotMetadata, StoreSnapshot};
pub use transaction::Transaction;
