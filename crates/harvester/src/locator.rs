//! Locator resolver: retrying reads against the currently loaded document.
//!
//! Documents render asynchronously and mutate under script-driven expansion, so
//! a single query is unreliable. Every document read in the engine goes through
//! [`Locator`], which treats "not yet present", "stale" and "timed out" as one
//! transient class and retries them within a bounded [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use crate::document::{DocumentAction, DocumentSession, Element, Selector};
use crate::error::{DocumentError, LocatorError};

/// Default number of probes per locator call.
pub const DEFAULT_LOCATOR_ATTEMPTS: u32 = 3;

/// Default pause between probes.
pub const DEFAULT_LOCATOR_DELAY: Duration = Duration::from_millis(500);

/// Per-call retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Whether exhaustion is an error (`true`) or a quiet miss (`false`).
    pub required: bool,
}

impl RetryPolicy {
    pub fn required(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            required: true,
        }
    }

    pub fn optional(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            required: false,
        }
    }

    pub fn with_required(self, required: bool) -> Self {
        Self { required, ..self }
    }

    /// Effective attempt count; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::optional(DEFAULT_LOCATOR_ATTEMPTS, DEFAULT_LOCATOR_DELAY)
    }
}

/// Retrying query front-end over one session's current document.
#[derive(Clone, Copy)]
pub struct Locator<'a> {
    session: &'a dyn DocumentSession,
    policy: RetryPolicy,
}

impl<'a> Locator<'a> {
    pub fn new(session: &'a dyn DocumentSession, policy: RetryPolicy) -> Self {
        Self { session, policy }
    }

    /// The policy used by the shorthand methods.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Find one node. `Ok(None)` only when the policy is optional.
    pub async fn locate(
        &self,
        selector: &Selector,
        scope: Option<&Element>,
        policy: RetryPolicy,
    ) -> Result<Option<Element>, LocatorError> {
        let scope = scope.map(|e| &e.handle);
        let session = self.session;
        retry(selector, policy, || session.find(selector, scope)).await
    }

    /// Find every matching node. An empty result counts as a transient miss.
    pub async fn locate_all(
        &self,
        selector: &Selector,
        scope: Option<&Element>,
        policy: RetryPolicy,
    ) -> Result<Vec<Element>, LocatorError> {
        let scope = scope.map(|e| &e.handle);
        let session = self.session;
        let found = retry(selector, policy, || async move {
            let nodes = session.find_all(selector, scope).await?;
            if nodes.is_empty() {
                Err(DocumentError::NotFound(selector.clone()))
            } else {
                Ok(nodes)
            }
        })
        .await?;
        Ok(found.unwrap_or_default())
    }

    /// Optional single lookup with the default policy.
    pub async fn find(
        &self,
        selector: &Selector,
        scope: Option<&Element>,
    ) -> Result<Option<Element>, LocatorError> {
        self.locate(selector, scope, self.policy.with_required(false))
            .await
    }

    /// Required single lookup with the default policy.
    pub async fn require(
        &self,
        selector: &Selector,
        scope: Option<&Element>,
    ) -> Result<Element, LocatorError> {
        let found = self
            .locate(selector, scope, self.policy.with_required(true))
            .await?;
        found.ok_or_else(|| LocatorError::Exhausted {
            selector: selector.clone(),
            attempts: self.policy.attempts(),
            last: DocumentError::NotFound(selector.clone()),
        })
    }

    /// Optional multi lookup with the default policy.
    pub async fn find_all(
        &self,
        selector: &Selector,
        scope: Option<&Element>,
    ) -> Result<Vec<Element>, LocatorError> {
        self.locate_all(selector, scope, self.policy.with_required(false))
            .await
    }

    /// Run a document-mutating action against a located node.
    pub async fn act(&self, action: DocumentAction, target: &Element) -> Result<(), LocatorError> {
        self.session
            .run_action(action, &target.handle)
            .await
            .map_err(LocatorError::from)
    }
}

/// Probe up to `policy.attempts()` times, sleeping between attempts.
async fn retry<T, F, Fut>(
    selector: &Selector,
    policy: RetryPolicy,
    mut probe: F,
) -> Result<Option<T>, LocatorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DocumentError>>,
{
    let attempts = policy.attempts();
    let mut last = DocumentError::NotFound(selector.clone());

    for attempt in 1..=attempts {
        match probe().await {
            Ok(found) => return Ok(Some(found)),
            Err(e) if e.is_transient() => {
                tracing::debug!("locate {selector}: attempt {attempt}/{attempts} missed ({e})");
                last = e;
            }
            Err(e) => return Err(LocatorError::Document(e)),
        }
        if attempt < attempts && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }

    if policy.required {
        Err(LocatorError::Exhausted {
            selector: selector.clone(),
            attempts,
            last,
        })
    } else {
        Ok(None)
    }
}
