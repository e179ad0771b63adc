//! In-process record store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{overlay, RecordStore};
use crate::error::StoreError;
use crate::value::{EntityId, PartialRecord, PersistedRecord};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<EntityId, PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<EntityId, PersistedRecord>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl RecordStore for MemoryStore {
    fn merge(
        &self,
        entity: &EntityId,
        partial: PartialRecord,
    ) -> Result<PersistedRecord, StoreError> {
        let mut records = self.records()?;
        let record = overlay(records.get(entity).cloned(), entity, partial)?;
        records.insert(entity.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError> {
        Ok(self.records()?.get(entity).cloned())
    }

    fn clear(&self, entity: Option<&EntityId>) -> Result<usize, StoreError> {
        let mut records = self.records()?;
        Ok(match entity {
            Some(id) => usize::from(records.remove(id).is_some()),
            None => {
                let n = records.len();
                records.clear();
                n
            }
        })
    }

    fn ids(&self) -> Result<Vec<EntityId>, StoreError> {
        Ok(self.records()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_contract() {
        crate::store::tests::exercise(&MemoryStore::new());
    }
}
