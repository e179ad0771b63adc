//! One pretty-printed JSON file per entity.
//!
//! The file holds the record's field mapping. The file name is the entity id
//! with `%` and `/` percent-escaped, plus `.json`. Writes go through a temp
//! file and a rename so a crash never leaves a half-written record.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{overlay, RecordStore};
use crate::error::StoreError;
use crate::value::{EntityId, FieldMap, PartialRecord, PersistedRecord};

const EXTENSION: &str = "json";

pub struct JsonDirStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonDirStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::debug!("Opened JSON record store at {}", dir.display());
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Default store under `~/.harvest/records`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".harvest")
            .join("records")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `entity`'s record.
    pub fn path_for(&self, entity: &EntityId) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", encode_file_stem(entity.as_str())))
    }

    fn read(&self, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError> {
        let path = self.path_for(entity);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let fields: FieldMap = serde_json::from_str(&data)?;
        Ok(Some(PersistedRecord {
            entity: entity.clone(),
            fields,
        }))
    }

    fn write(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.entity);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let json = serde_json::to_string_pretty(&record.fields)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn record_files(&self) -> Result<Vec<(EntityId, PathBuf)>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push((EntityId::new(decode_file_stem(stem)), path));
            }
        }
        out.sort();
        Ok(out)
    }
}

impl RecordStore for JsonDirStore {
    fn merge(
        &self,
        entity: &EntityId,
        partial: PartialRecord,
    ) -> Result<PersistedRecord, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let record = overlay(self.read(entity)?, entity, partial)?;
        self.write(&record)?;
        Ok(record)
    }

    fn get(&self, entity: &EntityId) -> Result<Option<PersistedRecord>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.read(entity)
    }

    fn clear(&self, entity: Option<&EntityId>) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let targets = match entity {
            Some(id) => vec![self.path_for(id)],
            None => self.record_files()?.into_iter().map(|(_, p)| p).collect(),
        };

        let mut removed = 0;
        for path in targets {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Cleared {removed} record(s) from {}", self.dir.display());
        Ok(removed)
    }

    fn ids(&self) -> Result<Vec<EntityId>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.record_files()?.into_iter().map(|(id, _)| id).collect())
    }
}

fn encode_file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2F") {
            out.push('/');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}
