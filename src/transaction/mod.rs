// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Transaction identity, lifecycle state and the per-key exclusive lock table.
// The `Transaction` handle itself lives with the store in `storage`.
//
// ============================================================================

pub mod locks;
pub mod state;

pub use locks::{LockKey, LockTable};
pub use state::{TransactionId, TransactionState};
