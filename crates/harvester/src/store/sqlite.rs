//! SQLite-backed record store.
//!
//! One row per entity in `records`, with the field mapping stored as JSON text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use super::{overlay, RecordStore};
use crate::error::StoreError;
use crate::value::{EntityId, FieldMap, PartialRecord, PersistedRecord};

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, StoreError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                entity TEXT PRIMARY KEY,
                fields TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// When the record was last merged, RFC 3339.
    pub fn updated_at(&self, entity: &EntityId) -> Result<Option<String>, StoreError> {
        let db = self.db()?;
        Ok(db
            .query_row(
                "SELECT updated_at FROM records WHERE entity = ?1",
                [entity.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn load(db: &Connection, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError> {
    let json: Option<String> = db
        .query_row(
            "SELECT fields FROM records WHERE entity = ?1",
            [entity.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => {
            let fields: FieldMap = serde_json::from_str(&json)?;
            Ok(Some(PersistedRecord {
                entity: entity.clone(),
                fields,
            }))
        }
        None => Ok(None),
    }
}

impl RecordStore for SqliteStore {
    fn merge(
        &self,
        entity: &EntityId,
        partial: PartialRecord,
    ) -> Result<PersistedRecord, StoreError> {
        let mut db = self.db()?;
        let tx = db.transaction()?;
        let record = overlay(load(&tx, entity)?, entity, partial)?;
        tx.execute(
            "INSERT OR REPLACE INTO records (entity, fields, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                entity.as_str(),
                serde_json::to_string(&record.fields)?,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn get(&self, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError> {
        let db = self.db()?;
        load(&db, entity)
    }

    fn clear(&self, entity: Option<&EntityId>) -> Result<usize, StoreError> {
        let db = self.db()?;
        let removed = match entity {
            Some(id) => db.execute("DELETE FROM records WHERE entity = ?1", [id.as_str()])?,
            None => db.execute("DELETE FROM records", [])?,
        };
        Ok(removed)
    }

    fn ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let db = self.db()?;
        let mut stmt = db.prepare("SELECT entity FROM records ORDER BY entity")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(EntityId::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_contract() {
        crate::store::tests::exercise(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("records.db");
        let id = EntityId::from("Aak");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .merge(&id, PartialRecord::new().with("class", "Specialist"))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(&id).unwrap().is_some());
        assert!(store.updated_at(&id).unwrap().is_some());
    }
}
