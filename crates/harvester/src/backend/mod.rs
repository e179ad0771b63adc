//! Document session backends.
//!
//! `chromium` drives a real headless browser; `fixture` serves saved HTML for
//! tests and offline replay.

pub mod chromium;
pub mod fixture;

use async_trait::async_trait;

use crate::document::{DocumentSession, SessionLauncher};
use crate::error::DocumentError;

pub use chromium::{ChromiumLauncher, ChromiumOptions};
pub use fixture::{FixtureLauncher, FixtureSite};

/// A launcher used when no browser is available. Every launch fails.
pub struct NoopLauncher;

#[async_trait]
impl SessionLauncher for NoopLauncher {
    async fn launch(&self) -> Result<Box<dyn DocumentSession>, DocumentError> {
        Err(DocumentError::Disconnected("no browser available".into()))
    }
}
