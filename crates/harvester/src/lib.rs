//! Harvester: resilient structured extraction over live browser documents.
//!
//! A batch of entity ids is turned into addresses, each document is loaded in
//! a supervised session, a pipeline of isolated extractor units reads it
//! through a retrying locator, and every unit's output is merged into a
//! persistent per-entity record.

pub mod backend;
pub mod config;
pub mod discovery;
pub mod document;
pub mod error;
pub mod extract;
pub mod locator;
pub mod navigation;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod runlog;
pub mod session;
pub mod store;
pub mod value;

pub use config::HarvestConfig;
pub use discovery::discover_ids;
pub use document::{
    DocumentAction, DocumentSession, Element, ElementHandle, Selector, SessionLauncher,
};
pub use error::{
    ConfigError, DiscoveryError, DocumentError, ExtractionError, LocatorError, NavigationError,
    SessionError, StoreError,
};
pub use extract::{ConfiguredUnit, ExtractorSpec, FieldSpec};
pub use locator::{Locator, RetryPolicy};
pub use navigation::{AddressTemplate, Navigator, Ready};
pub use orchestrator::{BatchReport, BatchSettings, EntityReport, Orchestrator, StopSignal};
pub use pipeline::{ExtractorUnit, Pipeline, UnitOutcome};
pub use session::{Document, Session, SessionManager, SessionState};
pub use store::{JsonDirStore, MemoryStore, RecordStore, SqliteStore};
pub use value::{EntityId, FieldMap, FieldValue, PartialRecord, PersistedRecord};
