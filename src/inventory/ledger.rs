use super::dedup::RequestLog;
use crate::core::{
    InventoryError, InventoryItem, InventoryItemView, ItemId, RequestId, RequestRecord, Result,
    TransientFault,
};
use crate::storage::{StoreMap, TransactionalStore};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{Instrument, Level, event, info_span};

pub const ITEMS_MAP: &str = "inventory-items";

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// The stock ledger: every operation runs in exactly one store transaction.
#[derive(Clone)]
pub struct StockLedger {
    store: TransactionalStore,
    items: StoreMap<InventoryItem>,
    requests: RequestLog,
    faults: broadcast::Sender<TransientFault>,
}

impl StockLedger {
    pub async fn open(store: TransactionalStore) -> Result<Self> {
        let items = store.open_map(ITEMS_MAP).await?;
        let requests = RequestLog::open(&store).await?;
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            items,
            requests,
            faults,
        })
    }

    pub fn store(&self) -> &TransactionalStore {
        &self.store
    }

    pub fn items(&self) -> &StoreMap<InventoryItem> {
        &self.items
    }

    pub fn requests(&self) -> &RequestLog {
        &self.requests
    }

    /// Transient faults detected by ledger operations.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<TransientFault> {
        self.faults.subscribe()
    }

    pub async fn create_item(&self, item: InventoryItem) -> Result<()> {
        item.validate()?;
        let span = info_span!("ledger.create_item", item_id = %item.id);
        async {
            let mut tx = self.store.begin().await;
            if tx.get_for_update(&self.items, item.id.as_str()).await?.is_some() {
                return Err(InventoryError::AlreadyExists(item.id.to_string()));
            }
            tx.set(&self.items, item.id.as_str(), &item).await?;
            tx.commit().await?;
            event!(Level::INFO, available = item.available_stock, "inventory item created");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Adds stock up to the item's max threshold. Unknown items add nothing.
    pub async fn add_stock(&self, item_id: &ItemId, quantity: u32) -> Result<u32> {
        let span = info_span!("ledger.add_stock", item_id = %item_id, quantity);
        async {
            let mut tx = self.store.begin().await;
            let Some(mut item) = tx.get_for_update(&self.items, item_id.as_str()).await? else {
                event!(Level::DEBUG, "add_stock on unknown item ignored");
                return Ok(0);
            };
            let added = item.add_stock(quantity);
            tx.set(&self.items, item_id.as_str(), &item).await?;
            tx.commit().await?;
            event!(Level::INFO, added, available = item.available_stock, "stock added");
            Ok(added)
        }
        .instrument(span)
        .await
    }

    /// Removes stock idempotently with respect to `request_id`.
    ///
    /// The first call for a request id mutates stock and records the amount
    /// removed; every later call with the same id replays that amount without
    /// touching stock. The recent-request marker is refreshed on every call.
    /// If commit fails nothing is durable and the caller retries with the same id.
    pub async fn remove_stock(
        &self,
        item_id: &ItemId,
        quantity: u32,
        request_id: &RequestId,
    ) -> Result<u32> {
        let span = info_span!(
            "ledger.remove_stock",
            item_id = %item_id,
            request_id = %request_id,
            quantity
        );
        async {
            let now = Utc::now();
            let mut tx = self.store.begin().await;

            let removed = match self.requests.lock_marker(&mut tx, request_id).await? {
                None => {
                    let removed = match tx.get_for_update(&self.items, item_id.as_str()).await? {
                        Some(mut item) => {
                            let removed = item.remove_stock(quantity);
                            tx.set(&self.items, item_id.as_str(), &item).await?;
                            removed
                        }
                        None => 0,
                    };
                    let record = RequestRecord {
                        item_id: item_id.clone(),
                        removed,
                    };
                    self.requests.write_record(&mut tx, request_id, &record).await?;
                    removed
                }
                Some(_) => match self.requests.locked_record(&mut tx, request_id).await? {
                    Some(record) => {
                        event!(Level::INFO, removed = record.removed, "remove_stock replayed");
                        record.removed
                    }
                    None => {
                        self.report_fault(TransientFault::InconsistentDedupState {
                            request_id: request_id.clone(),
                        });
                        0
                    }
                },
            };

            self.requests.touch(&mut tx, request_id, now).await?;
            tx.commit().await?;
            event!(Level::DEBUG, removed, "remove_stock committed");
            Ok(removed)
        }
        .instrument(span)
        .await
    }

    pub async fn exists(&self, item_id: &ItemId) -> Result<bool> {
        let tx = self.store.begin().await;
        let found = tx.get(&self.items, item_id.as_str()).await?.is_some();
        tx.commit().await?;
        Ok(found)
    }

    pub async fn get_item(&self, item_id: &ItemId) -> Result<Option<InventoryItem>> {
        let tx = self.store.begin().await;
        let item = tx.get(&self.items, item_id.as_str()).await?;
        tx.commit().await?;
        Ok(item)
    }

    /// Items a customer can currently order, as of one consistent snapshot.
    pub async fn customer_view(&self) -> Result<Vec<InventoryItemView>> {
        let tx = self.store.begin().await;
        let items = tx.enumerate(&self.items).await?;
        tx.commit().await?;
        Ok(items
            .iter()
            .map(|(_, item)| item)
            .filter(|item| item.customer_available_stock() > 0)
            .map(InventoryItemView::from)
            .collect())
    }

    /// Debug-only removal path; not part of the guaranteed ledger contract.
    pub async fn debug_delete_item(&self, item_id: &ItemId) -> Result<bool> {
        let mut tx = self.store.begin().await;
        let removed = tx.try_remove(&self.items, item_id.as_str()).await?.is_some();
        tx.commit().await?;
        event!(Level::WARN, item_id = %item_id, removed, "inventory item deleted via debug path");
        Ok(removed)
    }

    fn report_fault(&self, fault: TransientFault) {
        event!(Level::WARN, fault = %fault, "transient fault detected");
        // No subscribers is fine; the fault is still logged.
        let _ = self.faults.send(fault);
    }
}
