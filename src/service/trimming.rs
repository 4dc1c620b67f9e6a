use crate::core::{InventoryError, RequestId, Result, ShutdownSignal};
use crate::inventory::{RequestLog, StockLedger};
use crate::storage::{Transaction, TransactionalStore};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Level, event};

/// Default age after which request-dedup entries are dropped.
pub const DEFAULT_DEDUP_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub scanned: usize,
    pub removed: usize,
    /// Expired entries left for a later pass because another writer held them.
    pub skipped: usize,
}

/// Prunes request markers and records older than the retention window.
pub struct HistoryTrimmer {
    store: TransactionalStore,
    requests: RequestLog,
    retention: chrono::Duration,
    interval: Duration,
}

impl HistoryTrimmer {
    pub fn new(ledger: &StockLedger, retention: Duration, interval: Duration) -> Self {
        Self {
            store: ledger.store().clone(),
            requests: ledger.requests().clone(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            interval,
        }
    }

    pub async fn run(&self, shutdown: ShutdownSignal) {
        event!(Level::INFO, interval_ms = self.interval.as_millis() as u64, "history trimming loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {
                    if shutdown.is_shutdown() {
                        break;
                    }
                    if let Err(err) = self.trim_once().await {
                        event!(Level::WARN, error = %err, "history trimming pass failed");
                    }
                }
            }
        }
        event!(Level::INFO, "history trimming loop stopped");
    }

    pub async fn trim_once(&self) -> Result<TrimReport> {
        self.trim_once_at(Utc::now()).await
    }

    /// Deletes every entry last seen strictly before `now - retention`, in one commit.
    ///
    /// Each candidate is re-read under its lock, so a marker refreshed by a
    /// concurrent retry after the scan is kept. A candidate whose lock cannot
    /// be taken in time is skipped; the rest of the batch still commits.
    pub async fn trim_once_at(&self, now: DateTime<Utc>) -> Result<TrimReport> {
        let cutoff = now.checked_sub_signed(self.retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut tx = self.store.begin().await;
        let markers = self.requests.recent_markers(&tx).await?;

        let mut report = TrimReport {
            scanned: markers.len(),
            ..TrimReport::default()
        };
        let expired: Vec<RequestId> = markers
            .into_iter()
            .filter(|(_, seen_at)| *seen_at < cutoff)
            .map(|(id, _)| id)
            .collect();

        for request_id in expired {
            match self.trim_entry(&mut tx, &request_id, cutoff).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(InventoryError::ConflictOrTimeout(reason)) => {
                    event!(Level::DEBUG, request_id = %request_id, %reason, "request history entry busy, skipped");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        tx.commit().await?;
        if report.removed > 0 || report.skipped > 0 {
            event!(
                Level::INFO,
                scanned = report.scanned,
                removed = report.removed,
                skipped = report.skipped,
                %cutoff,
                "request history trimmed"
            );
        }
        Ok(report)
    }

    async fn trim_entry(&self, tx: &mut Transaction, request_id: &RequestId, cutoff: DateTime<Utc>) -> Result<bool> {
        match self.requests.lock_marker(tx, request_id).await? {
            Some(seen_at) if seen_at < cutoff => self.requests.forget(tx, request_id).await,
            _ => Ok(false),
        }
    }
}
