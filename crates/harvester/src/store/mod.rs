//! Record store: read-merge-write persistence keyed by entity id.
//!
//! Merge is shallow. Each top-level field of the incoming partial record
//! replaces any existing field of the same name, so when two units emit the
//! same field the later merge wins. Every such collision is logged at debug
//! level. Records are only ever removed by an explicit [`RecordStore::clear`].

pub mod json_dir;
pub mod memory;
pub mod sqlite;

use crate::error::StoreError;
use crate::value::{EntityId, PartialRecord, PersistedRecord};

pub use json_dir::JsonDirStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persistence for accumulated records. Shared across workers.
pub trait RecordStore: Send + Sync {
    /// Overlay `partial` onto the stored record for `entity` (creating it if
    /// absent) and return the result. Empty partials are rejected.
    fn merge(&self, entity: &EntityId, partial: PartialRecord)
        -> Result<PersistedRecord, StoreError>;

    fn get(&self, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError>;

    /// Remove one record, or every record when `entity` is `None`.
    /// Returns how many were removed.
    fn clear(&self, entity: Option<&EntityId>) -> Result<usize, StoreError>;

    /// Ids with a persisted record, sorted.
    fn ids(&self) -> Result<Vec<EntityId>, StoreError>;
}

/// Shared merge step for every store implementation.
pub(crate) fn overlay(
    existing: Option<PersistedRecord>,
    entity: &EntityId,
    partial: PartialRecord,
) -> Result<PersistedRecord, StoreError> {
    if entity.as_str().trim().is_empty() {
        return Err(StoreError::EmptyEntity);
    }
    if partial.is_empty() {
        return Err(StoreError::EmptyPartial(entity.to_string()));
    }
    let mut record = existing.unwrap_or_else(|| PersistedRecord::empty(entity.clone()));
    for key in record.overlay(partial) {
        tracing::debug!("Merge for {entity} replaced existing field `{key}`");
    }
    Ok(record)
}
