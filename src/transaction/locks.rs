//! Ownership-indexed exclusive lock table.
//!
//! One entry per `(map, key)` currently held, pointing at the owning
//! transaction. Waiters park on a shared `Notify` and re-check after every
//! release; acquisition is bounded by a timeout so lock cycles surface as
//! `ConflictOrTimeout` instead of hanging.

use super::TransactionId;
use crate::core::{InventoryError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub map: String,
    pub key: String,
}

impl LockKey {
    pub fn new(map: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.map, self.key)
    }
}

#[derive(Default)]
pub struct LockTable {
    owners: Mutex<HashMap<LockKey, TransactionId>>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `key` for `owner`, waiting at most `wait`. Re-entrant for the owner.
    pub async fn acquire(&self, key: &LockKey, owner: TransactionId, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between check and await is not lost.
            notified.as_mut().enable();

            let holder = {
                let mut owners = self.owners.lock()?;
                match owners.get(key) {
                    None => {
                        owners.insert(key.clone(), owner);
                        return Ok(());
                    }
                    Some(holder) if *holder == owner => return Ok(()),
                    Some(holder) => *holder,
                }
            };

            if timeout_at(deadline, notified).await.is_err() {
                return Err(InventoryError::ConflictOrTimeout(format!(
                    "lock on {} held by {} was not released within {}ms",
                    key,
                    holder,
                    wait.as_millis()
                )));
            }
        }
    }

    /// Releases every lock held by `owner`. Returns how many were released.
    pub fn release_all(&self, owner: TransactionId) -> usize {
        let released = match self.owners.lock() {
            Ok(mut owners) => {
                let before = owners.len();
                owners.retain(|_, holder| *holder != owner);
                before - owners.len()
            }
            Err(poisoned) => {
                let mut owners = poisoned.into_inner();
                let before = owners.len();
                owners.retain(|_, holder| *holder != owner);
                before - owners.len()
            }
        };
        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    pub fn holder(&self, key: &LockKey) -> Option<TransactionId> {
        self.owners.lock().ok().and_then(|owners| owners.get(key).copied())
    }

    pub fn held_count(&self) -> usize {
        self.owners.lock().map(|owners| owners.len()).unwrap_or_default()
    }
}
