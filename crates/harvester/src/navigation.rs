//! Navigation controller: entity id to address, load, wait for readiness.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::document::Selector;
use crate::error::{ConfigError, NavigationError};
use crate::locator::{Locator, RetryPolicy};
use crate::session::Session;
use crate::value::EntityId;

/// Placeholder substituted with the entity id.
pub const ID_PLACEHOLDER: &str = "{id}";

pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_NAV_ATTEMPTS: u32 = 3;
pub const DEFAULT_NAV_RETRY_DELAY: Duration = Duration::from_secs(1);

fn default_space_replacement() -> String {
    "_".to_string()
}

/// Maps an entity id to a resource address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTemplate {
    /// e.g. `https://arknights.fandom.com/wiki/{id}`
    pub template: String,
    /// What spaces in the id become.
    #[serde(default = "default_space_replacement")]
    pub space_replacement: String,
}

impl AddressTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, ConfigError> {
        let template = AddressTemplate {
            template: template.into(),
            space_replacement: default_space_replacement(),
        };
        template.validate()?;
        Ok(template)
    }

    pub fn with_space_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.space_replacement = replacement.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.template.contains(ID_PLACEHOLDER) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "address template `{}` has no {ID_PLACEHOLDER} placeholder",
                self.template
            )))
        }
    }

    /// Substitute `id` and validate the result.
    ///
    /// Templates with a scheme must produce a valid URL. Templates without one
    /// produce relative addresses, which fixture backends accept as-is.
    pub fn resolve(&self, id: &EntityId) -> Result<String, NavigationError> {
        let invalid = |address: String, reason: String| NavigationError {
            address,
            attempts: 0,
            last: reason,
        };

        let key = id.as_str().trim();
        if key.is_empty() {
            return Err(invalid(self.template.clone(), "empty entity id".into()));
        }
        let address = self
            .template
            .replace(ID_PLACEHOLDER, &key.replace(' ', &self.space_replacement));

        match url::Url::parse(&address) {
            Ok(url) => Ok(String::from(url)),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(address),
            Err(e) => Err(invalid(address, format!("invalid address: {e}"))),
        }
    }
}

/// A document that loaded and showed its readiness marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    /// Address reported by the session after loading.
    pub address: String,
    /// Wall time of the successful attempt, load plus readiness wait.
    pub load_time_ms: u64,
}

/// Loads documents and waits for them to become ready.
#[derive(Debug, Clone)]
pub struct Navigator {
    load_timeout: Duration,
    readiness: RetryPolicy,
    retry_delay: Duration,
}

impl Default for Navigator {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            readiness: RetryPolicy::required(10, Duration::from_millis(500)),
            retry_delay: DEFAULT_NAV_RETRY_DELAY,
        }
    }
}

impl Navigator {
    pub fn new(load_timeout: Duration, readiness: RetryPolicy, retry_delay: Duration) -> Self {
        Self {
            load_timeout,
            readiness: readiness.with_required(true),
            retry_delay,
        }
    }

    /// Load `address` and wait for `marker`, retrying the whole load.
    ///
    /// Stops early when the session itself is lost; liveness is the caller's
    /// concern.
    pub async fn load(
        &self,
        session: &mut Session,
        address: &str,
        marker: &Selector,
        max_attempts: u32,
    ) -> Result<Ready, NavigationError> {
        let attempts = max_attempts.max(1);
        let mut last = String::new();
        let mut made = 0;

        for attempt in 1..=attempts {
            made = attempt;
            session.set_address(None);
            let start = Instant::now();

            let lost = match self.attempt(session, address, marker).await {
                Ok(final_address) => {
                    let load_time_ms = start.elapsed().as_millis() as u64;
                    tracing::debug!("Loaded {final_address} in {load_time_ms}ms");
                    session.set_address(Some(final_address.clone()));
                    return Ok(Ready {
                        address: final_address,
                        load_time_ms,
                    });
                }
                Err((reason, lost)) => {
                    tracing::warn!(
                        "Load attempt {attempt}/{attempts} for {address} failed: {reason}"
                    );
                    last = reason;
                    lost
                }
            };

            if lost {
                break;
            }
            if attempt < attempts && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(NavigationError {
            address: address.to_string(),
            attempts: made,
            last,
        })
    }

    /// One load plus readiness wait. Errors carry whether the session was lost.
    async fn attempt(
        &self,
        session: &mut Session,
        address: &str,
        marker: &Selector,
    ) -> Result<String, (String, bool)> {
        session
            .backend_mut()
            .open(address, self.load_timeout)
            .await
            .map_err(|e| (e.to_string(), e.is_session_loss()))?;

        let backend = session.backend();
        Locator::new(backend, self.readiness)
            .locate(marker, None, self.readiness)
            .await
            .map_err(|e| (format!("not ready: {e}"), e.is_session_loss()))?;

        Ok(backend
            .current_address()
            .await
            .unwrap_or_else(|_| address.to_string()))
    }
}
