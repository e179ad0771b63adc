//! JSONL run log: one line per processed entity, append-only.
//!
//! Rotates when the file exceeds its size limit. Rotated files are named
//! `.1`, `.2`, ... with the oldest beyond `max_rotations` deleted.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::error::StoreError;

/// Default size before rotation (10 MB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of rotated files kept.
pub const DEFAULT_MAX_ROTATIONS: u32 = 5;

/// One line of the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry<'a> {
    pub timestamp: String,
    pub batch_id: &'a str,
    pub session_id: &'a str,
    pub generation: u32,
    pub entity: &'a str,
    pub succeeded: bool,
    pub elapsed_ms: u64,
    /// Navigation failure, if the entity never became ready.
    pub navigation_error: Option<&'a str>,
    pub merged: Vec<&'a str>,
    /// `(unit, reason)` for every unit that failed or could not be stored.
    pub failed: Vec<(&'a str, String)>,
}

/// Append-only JSONL writer with size-based rotation.
pub struct RunLog {
    file: File,
    path: PathBuf,
    current_size: u64,
    max_size: u64,
    max_rotations: u32,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            file,
            path: path.to_path_buf(),
            current_size,
            max_size: DEFAULT_MAX_LOG_SIZE,
            max_rotations: DEFAULT_MAX_ROTATIONS,
        })
    }

    pub fn with_rotation(mut self, max_size: u64, max_rotations: u32) -> Self {
        self.max_size = max_size;
        self.max_rotations = max_rotations.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, entry: &RunLogEntry<'_>) -> Result<(), StoreError> {
        if self.current_size >= self.max_size {
            self.rotate()?;
        }
        let json = serde_json::to_string(entry)?;
        writeln!(self.file, "{json}")?;
        self.current_size += json.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), StoreError> {
        self.file.flush()?;

        let oldest = rotation_path(&self.path, self.max_rotations);
        if oldest.exists() {
            let _ = std::fs::remove_file(&oldest);
        }
        for i in (1..self.max_rotations).rev() {
            let from = rotation_path(&self.path, i);
            if from.exists() {
                let _ = std::fs::rename(&from, rotation_path(&self.path, i + 1));
            }
        }
        let _ = std::fs::rename(&self.path, rotation_path(&self.path, 1));

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        tracing::debug!("Rotated run log {}", self.path.display());
        Ok(())
    }
}

/// Current time for [`RunLogEntry::timestamp`].
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("runs.jsonl")
    );
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(entity: &str) -> RunLogEntry<'_> {
        RunLogEntry {
            timestamp: now(),
            batch_id: "batch-1",
            session_id: "sess-1",
            generation: 0,
            entity,
            succeeded: true,
            elapsed_ms: 12,
            navigation_error: None,
            merged: vec!["stats"],
            failed: vec![("skills", "unit produced no fields".to_string())],
        }
    }

    #[test]
    fn test_appends_json_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("runs.jsonl");
        let mut log = RunLog::open(&path).unwrap();
        log.log(&entry("Aak")).unwrap();
        log.log(&entry("Exusiai")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["entity"], "Aak");
        assert_eq!(first["failed"][0][0], "skills");
    }

    #[test]
    fn test_rotation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("runs.jsonl");
        let mut log = RunLog::open(&path).unwrap().with_rotation(1, 2);
        for name in ["A", "B", "C", "D"] {
            log.log(&entry(name)).unwrap();
        }

        assert!(rotation_path(&path, 1).exists());
        assert!(rotation_path(&path, 2).exists());
        assert!(!rotation_path(&path, 3).exists());
        let current = std::fs::read_to_string(&path).unwrap();
        assert_eq!(current.lines().count(), 1);
        assert!(current.contains("\"entity\":\"D\""));
    }
}
