//! Configuration loading and resolution.
//!
//! A `HarvestConfig` is a JSON document; every field has a default. Values are
//! layered: file, then `HARVEST_*` environment overrides, then validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{ChromiumLauncher, ChromiumOptions, FixtureSite, NoopLauncher};
use crate::document::{Selector, SessionLauncher};
use crate::error::{ConfigError, StoreError};
use crate::extract::ConfiguredUnit;
use crate::locator::RetryPolicy;
use crate::navigation::{AddressTemplate, Navigator};
use crate::orchestrator::BatchSettings;
use crate::pipeline::{ExtractorUnit, Pipeline};
use crate::session::SessionManager;
use crate::store::{JsonDirStore, MemoryStore, RecordStore, SqliteStore};

/// Database file name for the SQLite store inside a store directory.
pub const SQLITE_FILE: &str = "records.db";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub address: AddressTemplate,
    /// Element whose presence means the document is ready.
    pub readiness_marker: Selector,
    pub locator: LocatorConfig,
    pub navigation: NavigationConfig,
    pub batch: BatchConfig,
    pub session: SessionConfig,
    pub browser: BrowserConfig,
    pub store: StoreConfig,
    /// Units in run order.
    pub extractors: Vec<ConfiguredUnit>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            address: AddressTemplate {
                template: "{id}".to_string(),
                space_replacement: "_".to_string(),
            },
            readiness_marker: Selector::css("body"),
            locator: LocatorConfig::default(),
            navigation: NavigationConfig::default(),
            batch: BatchConfig::default(),
            session: SessionConfig::default(),
            browser: BrowserConfig::default(),
            store: StoreConfig::default(),
            extractors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub load_timeout_ms: u64,
    pub readiness_attempts: u32,
    pub readiness_delay_ms: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 20_000,
            readiness_attempts: 10,
            readiness_delay_ms: 500,
            attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: usize,
    pub pacing_ms: u64,
    pub clean_before_run: bool,
    pub run_log: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            pacing_ms: 1_000,
            clean_before_run: false,
            run_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub create_attempts: u32,
    pub create_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_attempts: 3,
            create_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Chromium,
    /// Saved `*.html` pages from `fixture_dir`.
    Fixture,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub backend: BackendKind,
    pub executable: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub query_timeout_ms: u64,
    pub extra_args: Vec<String>,
    pub fixture_dir: Option<PathBuf>,
    /// Prepended to each fixture file stem to form its address.
    pub fixture_prefix: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Chromium,
            executable: None,
            window_width: 1920,
            window_height: 1080,
            query_timeout_ms: 5_000,
            extra_args: Vec::new(),
            fixture_dir: None,
            fixture_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    JsonDir,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Directory for `json_dir`, database file for `sqlite`.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::JsonDir,
            path: None,
        }
    }
}

/// Resolve the config file path.
///
/// Explicit path, then `HARVEST_CONFIG`, then `./harvest.json`, then
/// `~/.harvest/harvest.json`. Returns `None` when no file exists.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Some(env_path) = read_env_string("HARVEST_CONFIG").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from("harvest.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    let home_config = default_home().join("harvest.json");
    home_config.exists().then_some(home_config)
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harvest")
}

impl HarvestConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read `path` without applying overrides or validating.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Resolve, read, apply environment overrides and validate.
    pub fn load(explicit: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match resolve_config_path(explicit) {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                tracing::info!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HARVEST_*` overrides. Unparsable values keep the current one.
    pub fn apply_env(&mut self) {
        self.batch.workers = read_env_usize("HARVEST_WORKERS", self.batch.workers);
        self.batch.pacing_ms = read_env_u64("HARVEST_PACING_MS", self.batch.pacing_ms);
        self.locator.attempts = read_env_u32("HARVEST_LOCATOR_ATTEMPTS", self.locator.attempts);
        self.navigation.attempts = read_env_u32("HARVEST_NAV_ATTEMPTS", self.navigation.attempts);
        if let Some(dir) = read_env_string("HARVEST_STORE_DIR").filter(|d| !d.is_empty()) {
            self.apply_store_dir(dir);
        }
        if let Some(path) = read_env_string("HARVEST_CHROME_PATH").filter(|p| !p.is_empty()) {
            self.browser.executable = Some(PathBuf::from(path));
        }
    }

    /// Point the store at `dir`. SQLite keeps its database file inside it.
    pub fn apply_store_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.store.path = Some(match self.store.kind {
            StoreKind::Sqlite => dir.join(SQLITE_FILE),
            StoreKind::Memory | StoreKind::JsonDir => dir,
        });
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.address.validate()?;
        if self.batch.workers == 0 {
            return Err(ConfigError::Invalid("batch.workers must be at least 1".into()));
        }
        if self.extractors.is_empty() {
            return Err(ConfigError::Invalid("no extractors configured".into()));
        }
        if self.browser.backend == BackendKind::Fixture && self.browser.fixture_dir.is_none() {
            return Err(ConfigError::Invalid(
                "fixture backend needs browser.fixture_dir".into(),
            ));
        }
        self.pipeline().map(|_| ())
    }

    /// Default policy for extractor reads.
    pub fn locator_policy(&self) -> RetryPolicy {
        RetryPolicy::optional(
            self.locator.attempts,
            Duration::from_millis(self.locator.delay_ms),
        )
    }

    pub fn navigator(&self) -> Navigator {
        let nav = &self.navigation;
        Navigator::new(
            Duration::from_millis(nav.load_timeout_ms),
            RetryPolicy::required(
                nav.readiness_attempts,
                Duration::from_millis(nav.readiness_delay_ms),
            ),
            Duration::from_millis(nav.retry_delay_ms),
        )
    }

    pub fn pipeline(&self) -> Result<Pipeline, ConfigError> {
        let units = self
            .extractors
            .iter()
            .cloned()
            .map(|unit| Arc::new(unit) as Arc<dyn ExtractorUnit>)
            .collect();
        Pipeline::new(units)
    }

    pub fn store(&self) -> Result<Arc<dyn RecordStore>, StoreError> {
        let store: Arc<dyn RecordStore> = match self.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::JsonDir => Arc::new(JsonDirStore::open(
                self.store.path.clone().unwrap_or_else(JsonDirStore::default_dir),
            )?),
            StoreKind::Sqlite => {
                let path = self
                    .store
                    .path
                    .clone()
                    .unwrap_or_else(|| default_home().join(SQLITE_FILE));
                Arc::new(SqliteStore::open(&path)?)
            }
        };
        Ok(store)
    }

    pub fn launcher(&self) -> Result<Arc<dyn SessionLauncher>, ConfigError> {
        let browser = &self.browser;
        let launcher: Arc<dyn SessionLauncher> = match browser.backend {
            BackendKind::Chromium => Arc::new(ChromiumLauncher::new(ChromiumOptions {
                executable: browser.executable.clone(),
                window_width: browser.window_width,
                window_height: browser.window_height,
                query_timeout: Duration::from_millis(browser.query_timeout_ms),
                extra_args: browser.extra_args.clone(),
            })),
            BackendKind::Fixture => {
                let dir = browser.fixture_dir.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("fixture backend needs browser.fixture_dir".into())
                })?;
                let site = FixtureSite::from_dir(dir, &browser.fixture_prefix).map_err(
                    |source| ConfigError::Io {
                        path: dir.display().to_string(),
                        source,
                    },
                )?;
                Arc::new(site.launcher())
            }
            BackendKind::Noop => Arc::new(NoopLauncher),
        };
        Ok(launcher)
    }

    pub fn session_manager(&self) -> Result<SessionManager, ConfigError> {
        Ok(SessionManager::new(self.launcher()?).with_retry(
            self.session.create_attempts,
            Duration::from_millis(self.session.create_backoff_ms),
        ))
    }

    pub fn orchestrator_settings(&self) -> BatchSettings {
        BatchSettings {
            workers: self.batch.workers,
            pacing: Duration::from_millis(self.batch.pacing_ms),
            navigation_attempts: self.navigation.attempts,
            clean_before_run: self.batch.clean_before_run,
            run_log: self.batch.run_log.clone(),
        }
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}
