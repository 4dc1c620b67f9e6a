use crate::core::{InventoryError, Result};
use crate::transaction::LockKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle to a named map inside the store.
///
/// The handle carries no data; every read and write goes through a
/// [`Transaction`](super::Transaction).
pub struct StoreMap<V> {
    name: Arc<str>,
    _value: PhantomData<fn() -> V>,
}

impl<V> StoreMap<V> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_key(&self, key: &str) -> LockKey {
        LockKey::new(self.name.as_ref(), key)
    }
}

impl<V> Clone for StoreMap<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for StoreMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreMap").field("name", &self.name).finish()
    }
}

pub(crate) fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| InventoryError::SerializationError(format!("Failed to encode value: {}", e)))
}

pub(crate) fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| InventoryError::SerializationError(format!("Failed to decode value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InventoryItem;

    #[test]
    fn item_survives_encoding() {
        let item = InventoryItem::new("sku-1", "widget", 4.0, 3, 1, 10);
        let bytes = encode(&item).unwrap();
        let decoded: InventoryItem = decode(&bytes).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = decode::<InventoryItem>(&[0xc1]).unwrap_err();
        assert!(matches!(err, InventoryError::SerializationError(_)));
    }

    #[test]
    fn lock_key_is_scoped_by_map() {
        let map: StoreMap<u64> = StoreMap::new("counters");
        assert_eq!(map.lock_key("a"), LockKey::new("counters", "a"));
    }
}
