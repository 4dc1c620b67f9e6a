//! Request deduplication log.
//!
//! Two maps keyed by request id: the recent-request markers (last seen time)
//! and the request records (canonical `remove_stock` answer). A marker is only
//! ever written alongside its record, and both are pruned together.

use crate::core::{RequestId, RequestRecord, Result};
use crate::storage::{StoreMap, Transaction, TransactionalStore};
use chrono::{DateTime, Utc};

pub const RECENT_REQUESTS_MAP: &str = "recent-requests";
pub const REQUEST_RECORDS_MAP: &str = "request-records";

#[derive(Debug, Clone)]
pub struct RequestLog {
    markers: StoreMap<DateTime<Utc>>,
    records: StoreMap<RequestRecord>,
}

impl RequestLog {
    pub async fn open(store: &TransactionalStore) -> Result<Self> {
        Ok(Self {
            markers: store.open_map(RECENT_REQUESTS_MAP).await?,
            records: store.open_map(REQUEST_RECORDS_MAP).await?,
        })
    }

    pub fn markers(&self) -> &StoreMap<DateTime<Utc>> {
        &self.markers
    }

    pub fn records(&self) -> &StoreMap<RequestRecord> {
        &self.records
    }

    /// Locks the marker for `request_id` and returns its last-seen time.
    pub async fn lock_marker(
        &self,
        tx: &mut Transaction,
        request_id: &RequestId,
    ) -> Result<Option<DateTime<Utc>>> {
        tx.get_for_update(&self.markers, request_id.as_str()).await
    }

    pub async fn locked_record(
        &self,
        tx: &mut Transaction,
        request_id: &RequestId,
    ) -> Result<Option<RequestRecord>> {
        tx.get_for_update(&self.records, request_id.as_str()).await
    }

    pub async fn write_record(
        &self,
        tx: &mut Transaction,
        request_id: &RequestId,
        record: &RequestRecord,
    ) -> Result<()> {
        tx.set(&self.records, request_id.as_str(), record).await
    }

    pub async fn touch(
        &self,
        tx: &mut Transaction,
        request_id: &RequestId,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        tx.set(&self.markers, request_id.as_str(), &seen_at).await
    }

    /// Deletes both the marker and the record. Returns true if either existed.
    pub async fn forget(&self, tx: &mut Transaction, request_id: &RequestId) -> Result<bool> {
        // Both locks before either removal, so a conflict leaves nothing buffered.
        tx.get_for_update(&self.markers, request_id.as_str()).await?;
        tx.get_for_update(&self.records, request_id.as_str()).await?;
        let marker = tx.try_remove(&self.markers, request_id.as_str()).await?;
        let record = tx.try_remove(&self.records, request_id.as_str()).await?;
        Ok(marker.is_some() || record.is_some())
    }

    /// Markers visible in the transaction's snapshot.
    pub async fn recent_markers(&self, tx: &Transaction) -> Result<Vec<(RequestId, DateTime<Utc>)>> {
        Ok(tx
            .enumerate(&self.markers)
            .await?
            .into_iter()
            .map(|(id, seen_at)| (RequestId::new(id), seen_at))
            .collect())
    }

    pub async fn record(&self, tx: &Transaction, request_id: &RequestId) -> Result<Option<RequestRecord>> {
        tx.get(&self.records, request_id.as_str()).await
    }

    pub async fn marker(&self, tx: &Transaction, request_id: &RequestId) -> Result<Option<DateTime<Utc>>> {
        tx.get(&self.markers, request_id.as_str()).await
    }
}
