use super::{InventoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of an inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Caller-supplied idempotency token for `remove_stock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A stocked item.
///
/// `restock_threshold <= max_stock_threshold` holds for every item accepted by
/// the ledger. `available_stock` is never pushed above `max_stock_threshold`
/// by `add_stock` and never below zero by `remove_stock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: ItemId,
    pub description: String,
    pub unit_price: f64,
    pub available_stock: u32,
    pub restock_threshold: u32,
    pub max_stock_threshold: u32,
    pub on_reorder: bool,
}

impl InventoryItem {
    pub fn new(
        id: impl Into<ItemId>,
        description: impl Into<String>,
        unit_price: f64,
        available_stock: u32,
        restock_threshold: u32,
        max_stock_threshold: u32,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            unit_price,
            available_stock,
            restock_threshold,
            max_stock_threshold,
            on_reorder: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(InventoryError::InvalidItem("item id must not be empty".into()));
        }
        if self.restock_threshold > self.max_stock_threshold {
            return Err(InventoryError::InvalidItem(format!(
                "restock threshold {} exceeds max stock threshold {} for '{}'",
                self.restock_threshold, self.max_stock_threshold, self.id
            )));
        }
        if !self.unit_price.is_finite() || self.unit_price < 0.0 {
            return Err(InventoryError::InvalidItem(format!(
                "unit price {} is not a valid price for '{}'",
                self.unit_price, self.id
            )));
        }
        Ok(())
    }

    /// Adds up to `quantity`, capped at `max_stock_threshold`. Returns the delta applied.
    pub fn add_stock(&mut self, quantity: u32) -> u32 {
        let room = self.max_stock_threshold.saturating_sub(self.available_stock);
        let added = quantity.min(room);
        self.available_stock += added;
        self.on_reorder = false;
        added
    }

    /// Removes up to `quantity`, never below zero. Returns the delta applied.
    pub fn remove_stock(&mut self, quantity: u32) -> u32 {
        let removed = quantity.min(self.available_stock);
        self.available_stock -= removed;
        removed
    }

    pub fn needs_restock(&self) -> bool {
        self.available_stock <= self.restock_threshold && !self.on_reorder
    }

    pub fn restock_quantity(&self) -> u32 {
        self.max_stock_threshold.saturating_sub(self.available_stock)
    }

    /// Stock a customer can order right now.
    pub fn customer_available_stock(&self) -> u32 {
        self.available_stock
    }
}

/// Customer-facing projection of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItemView {
    pub id: ItemId,
    pub description: String,
    pub unit_price: f64,
    pub customer_available_stock: u32,
}

impl From<&InventoryItem> for InventoryItemView {
    fn from(item: &InventoryItem) -> Self {
        Self {
            id: item.id.clone(),
            description: item.description.clone(),
            unit_price: item.unit_price,
            customer_available_stock: item.customer_available_stock(),
        }
    }
}

/// Canonical answer for a `remove_stock` request id. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub item_id: ItemId,
    pub removed: u32,
}

/// Signals that callers upstream should treat as a transient partition-level fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientFault {
    /// A recent-request marker exists without its request record.
    InconsistentDedupState { request_id: RequestId },
}

impl fmt::Display for TransientFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientFault::InconsistentDedupState { request_id } => {
                write!(f, "request '{}' has a marker but no record", request_id)
            }
        }
    }
}
