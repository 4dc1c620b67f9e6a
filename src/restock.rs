//! Downstream restock service contract and its HTTP client.

use crate::core::{InventoryError, ItemId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A replenishment order for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestockRequest {
    pub request_id: Uuid,
    pub item_id: ItemId,
    pub quantity: u32,
    pub requested_at: DateTime<Utc>,
}

impl RestockRequest {
    pub fn new(item_id: ItemId, quantity: u32) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            item_id,
            quantity,
            requested_at: Utc::now(),
        }
    }
}

/// Fire-and-forget submission; only success or failure is observed.
#[async_trait]
pub trait RestockClient: Send + Sync {
    async fn submit_restock_request(&self, request: &RestockRequest) -> Result<()>;
}

/// Posts restock requests as JSON to `{base_url}/restock-requests`.
pub struct HttpRestockClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRestockClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InventoryError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/restock-requests", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RestockClient for HttpRestockClient {
    async fn submit_restock_request(&self, request: &RestockRequest) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| InventoryError::DownstreamUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = HttpRestockClient::new("http://restock.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://restock.local/restock-requests");
    }

    #[test]
    fn requests_get_distinct_ids() {
        let a = RestockRequest::new(ItemId::new("sku"), 3);
        let b = RestockRequest::new(ItemId::new("sku"), 3);
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.quantity, 3);
    }

    #[tokio::test]
    async fn unreachable_service_is_downstream_unavailable() {
        let client = HttpRestockClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client
            .submit_restock_request(&RestockRequest::new(ItemId::new("sku"), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::DownstreamUnavailable(_)));
    }
}
