pub mod error;
pub mod shutdown;
pub mod types;

pub use error::{InventoryError, Result};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};
pub use types::{
    InventoryItem, InventoryItemView, ItemId, RequestId, RequestRecord, TransientFault,
};
