//! Error taxonomy for the extraction engine.
//!
//! Each layer owns one enum. Lower layers are wrapped, never flattened, so the
//! orchestrator can tell a missing element from a dead browser.

use std::time::Duration;

use crate::document::Selector;

/// Failures reported by a [`DocumentSession`](crate::document::DocumentSession) backend.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DocumentError {
    #[error("no node matches {0}")]
    NotFound(Selector),

    #[error("element handle {0} no longer refers to a node in the current document")]
    Stale(String),

    #[error("document operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: Selector, reason: String },

    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("no document loaded")]
    NoDocument,

    #[error("load failed for {address}: {reason}")]
    Load { address: String, reason: String },
}

impl DocumentError {
    /// Not-yet-present, stale and timed-out reads are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DocumentError::NotFound(_) | DocumentError::Stale(_) | DocumentError::Timeout(_)
        )
    }

    /// The session behind the document is gone.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, DocumentError::Disconnected(_))
    }
}

/// Locator Resolver failures.
#[derive(thiserror::Error, Debug, Clone)]
pub enum LocatorError {
    /// A required query never succeeded within its retry budget.
    #[error("{selector} not found after {attempts} attempt(s): {last}")]
    Exhausted {
        selector: Selector,
        attempts: u32,
        last: DocumentError,
    },

    /// A non-transient backend failure; not retried.
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl LocatorError {
    pub fn is_session_loss(&self) -> bool {
        match self {
            LocatorError::Document(e) => e.is_session_loss(),
            LocatorError::Exhausted { .. } => false,
        }
    }
}

/// Session lifecycle failures.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
    /// Session creation failed after its bounded retry. Terminal for a worker.
    #[error("session creation failed after {attempts} attempt(s): {reason}")]
    Fatal { attempts: u32, reason: String },
}

/// A resource never became ready within the allowed number of loads.
#[derive(thiserror::Error, Debug, Clone)]
#[error("navigation to {address} failed after {attempts} attempt(s): {last}")]
pub struct NavigationError {
    pub address: String,
    pub attempts: u32,
    pub last: String,
}

/// Failures while collecting entity ids from an index document.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Locator(#[from] LocatorError),
}

/// One extractor unit's failure. Isolated to that unit.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExtractionError {
    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("unexpected structure: {0}")]
    Structure(String),

    #[error("unit produced no fields")]
    Empty,

    #[error("unit panicked: {0}")]
    Panicked(String),
}

impl ExtractionError {
    pub fn is_session_loss(&self) -> bool {
        match self {
            ExtractionError::Locator(e) => e.is_session_loss(),
            ExtractionError::Document(e) => e.is_session_loss(),
            _ => false,
        }
    }
}

/// Record Store failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("refusing to merge an empty partial record for {0}")]
    EmptyPartial(String),

    #[error("refusing to merge a record without an entity id")]
    EmptyEntity,

    #[error("store lock poisoned")]
    Poisoned,
}

/// Configuration loading and validation failures.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_class() {
        let sel = Selector::css("div.x");
        assert!(DocumentError::NotFound(sel.clone()).is_transient());
        assert!(DocumentError::Stale("p1:n3".into()).is_transient());
        assert!(DocumentError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(!DocumentError::Disconnected("gone".into()).is_transient());
        assert!(!DocumentError::Unsupported("xpath".into()).is_transient());
    }

    #[test]
    fn test_session_loss_propagates_through_wrappers() {
        let loss = DocumentError::Disconnected("ws closed".into());
        assert!(ExtractionError::from(LocatorError::from(loss.clone())).is_session_loss());
        assert!(ExtractionError::from(loss).is_session_loss());
        assert!(!ExtractionError::Empty.is_session_loss());
    }
}
