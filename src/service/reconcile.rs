//! Reconciliation loop: orders restocks for items at or below their threshold.
//!
//! Each pass reads every item from one snapshot, then handles each low item
//! outside any transaction: the restock request goes downstream first, and
//! only afterwards a short transaction flips `on_reorder` if the item is
//! unchanged since the snapshot. A crash between the two steps means the next
//! pass orders the same item again; downstream is expected to tolerate that.

use crate::core::{InventoryItem, Result, ShutdownSignal};
use crate::inventory::StockLedger;
use crate::restock::{RestockClient, RestockRequest};
use crate::storage::{StoreMap, TransactionalStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub restocks_requested: usize,
    pub flagged: usize,
    /// Items changed by another writer between the snapshot and the flag update.
    pub stale: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: TransactionalStore,
    items: StoreMap<InventoryItem>,
    client: Arc<dyn RestockClient>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(ledger: &StockLedger, client: Arc<dyn RestockClient>, interval: Duration) -> Self {
        Self {
            store: ledger.store().clone(),
            items: ledger.items().clone(),
            client,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs passes every `interval` until shutdown. Pass failures are logged.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        event!(Level::INFO, interval_ms = self.interval.as_millis() as u64, "reconciliation loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {
                    if shutdown.is_shutdown() {
                        break;
                    }
                    if let Err(err) = self.reconcile_once(&shutdown).await {
                        event!(Level::WARN, error = %err, "reconciliation pass failed");
                    }
                }
            }
        }
        event!(Level::INFO, "reconciliation loop stopped");
    }

    pub async fn reconcile_once(&self, shutdown: &ShutdownSignal) -> Result<ReconcileReport> {
        let span = info_span!("reconcile.pass");
        async {
            let snapshot = {
                let tx = self.store.begin().await;
                let items = tx.enumerate(&self.items).await?;
                tx.commit().await?;
                items
            };

            let mut report = ReconcileReport {
                scanned: snapshot.len(),
                ..ReconcileReport::default()
            };

            for (_, item) in snapshot {
                if shutdown.is_shutdown() {
                    break;
                }
                if !item.needs_restock() {
                    continue;
                }

                let request = RestockRequest::new(item.id.clone(), item.restock_quantity());
                if let Err(err) = self.client.submit_restock_request(&request).await {
                    report.failed += 1;
                    event!(Level::WARN, item_id = %item.id, error = %err, "restock request failed");
                    continue;
                }
                report.restocks_requested += 1;
                event!(
                    Level::INFO,
                    item_id = %item.id,
                    quantity = request.quantity,
                    request_id = %request.request_id,
                    "restock requested"
                );

                match self.flag_on_reorder(&item).await {
                    Ok(true) => report.flagged += 1,
                    Ok(false) => {
                        report.stale += 1;
                        event!(Level::DEBUG, item_id = %item.id, "item changed since scan; flag skipped");
                    }
                    Err(err) => {
                        report.failed += 1;
                        event!(Level::WARN, item_id = %item.id, error = %err, "failed to flag item on reorder");
                    }
                }
            }

            event!(
                Level::DEBUG,
                scanned = report.scanned,
                requested = report.restocks_requested,
                flagged = report.flagged,
                stale = report.stale,
                failed = report.failed,
                "reconciliation pass finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Sets `on_reorder` only if the stored item still equals `observed`.
    async fn flag_on_reorder(&self, observed: &InventoryItem) -> Result<bool> {
        let mut tx = self.store.begin().await;
        let current = tx.get_for_update(&self.items, observed.id.as_str()).await?;
        if current.as_ref() != Some(observed) {
            tx.abort();
            return Ok(false);
        }

        let mut flagged = observed.clone();
        flagged.on_reorder = true;
        tx.set(&self.items, observed.id.as_str(), &flagged).await?;
        tx.commit().await?;
        Ok(true)
    }
}
