pub mod dedup;
pub mod ledger;

pub use dedup::{RECENT_REQUESTS_MAP, REQUEST_RECORDS_MAP, RequestLog};
pub use ledger::{ITEMS_MAP, StockLedger};
