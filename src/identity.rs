// src/identity.rs
use hashbrown::HashMap;
use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;

/// Id logged for devices the store does not know.
pub const UNKNOWN_TRACKER: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum CacheKey {
    Number { num: String, kind: String },
    Sim { phone: String, kind: String },
}

/// Read-through cache of (device, type) -> tracker id.
///
/// Entries live for the whole process: ids never change for a device. Misses
/// are not remembered, so an unknown device is looked up again next time.
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: HashMap<CacheKey, u32>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn resolve<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        num: &str,
        phone: &str,
        kind: &str,
    ) -> Result<u32, StoreError> {
        let key = if !num.is_empty() {
            CacheKey::Number {
                num: num.to_owned(),
                kind: kind.to_owned(),
            }
        } else if !phone.is_empty() {
            CacheKey::Sim {
                phone: phone.to_owned(),
                kind: kind.to_owned(),
            }
        } else {
            return Ok(UNKNOWN_TRACKER);
        };

        if let Some(&id) = self.entries.get(&key) {
            return Ok(id);
        }

        let found = match &key {
            CacheKey::Number { num, kind } => store.tracker_by_number(num, kind).await?,
            CacheKey::Sim { phone, kind } => store.tracker_by_phone(phone, kind).await?,
        };

        let Some(id) = found else {
            return Ok(UNKNOWN_TRACKER);
        };

        debug!(?key, id, "identity: resolved");
        self.entries.insert(key, id);
        Ok(id)
    }
}
