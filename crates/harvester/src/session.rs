//! Session lifecycle: create, liveness-check, recreate on death, close.
//!
//! A [`Session`] is owned by exactly one worker and moved, never shared.
//! Its [`SessionState`] changes only through [`SessionManager`], which also
//! keeps a table of every open session's state for outside observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::document::{DocumentSession, SessionLauncher};
use crate::error::SessionError;
use crate::locator::{Locator, RetryPolicy};

/// Default number of launch attempts before a session is declared fatal.
pub const DEFAULT_CREATE_ATTEMPTS: u32 = 3;

/// Default pause between launch attempts.
pub const DEFAULT_CREATE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Dead,
    Recreating,
}

/// A live document session plus its diagnostics.
pub struct Session {
    id: String,
    generation: u32,
    state: SessionState,
    backend: Box<dyn DocumentSession>,
    address: Option<String>,
    created_at: Instant,
}

impl Session {
    fn new(id: String, generation: u32, backend: Box<dyn DocumentSession>) -> Self {
        Self {
            id,
            generation,
            state: SessionState::Active,
            backend,
            address: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of times this session has been recreated.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// How long the current backend has been alive.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Address of the last successfully readied document, if any.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Borrow the currently loaded document for reading.
    ///
    /// The borrow prevents navigation for as long as the handle lives.
    pub fn document(&self, policy: RetryPolicy) -> Document<'_> {
        Document {
            address: self.address.as_deref().unwrap_or("about:blank"),
            locator: Locator::new(self.backend.as_ref(), policy),
        }
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn DocumentSession {
        self.backend.as_mut()
    }

    pub(crate) fn backend(&self) -> &dyn DocumentSession {
        self.backend.as_ref()
    }

    pub(crate) fn set_address(&mut self, address: Option<String>) {
        self.address = address;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("address", &self.address)
            .finish()
    }
}

/// Read access to the document currently loaded in a session.
#[derive(Clone, Copy)]
pub struct Document<'a> {
    address: &'a str,
    locator: Locator<'a>,
}

impl<'a> Document<'a> {
    pub fn address(&self) -> &'a str {
        self.address
    }

    pub fn locator(&self) -> &Locator<'a> {
        &self.locator
    }
}

/// Creates and recovers sessions through a [`SessionLauncher`].
pub struct SessionManager {
    launcher: Arc<dyn SessionLauncher>,
    create_attempts: u32,
    create_backoff: Duration,
    next_id: AtomicU64,
    states: Mutex<HashMap<String, SessionState>>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            create_attempts: DEFAULT_CREATE_ATTEMPTS,
            create_backoff: DEFAULT_CREATE_BACKOFF,
            next_id: AtomicU64::new(0),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Set the bounded launch retry used by `create` and `recreate`.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.create_attempts = attempts.max(1);
        self.create_backoff = backoff;
        self
    }

    /// Launch a new Active session.
    pub async fn create(&self) -> Result<Session, SessionError> {
        let backend = self.launch().await?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("sess-{n}");
        tracing::info!("Created session {id}");
        self.publish(&id, Some(SessionState::Active));
        Ok(Session::new(id, 0, backend))
    }

    /// State of an open session by id. `None` once it is closed or lost.
    ///
    /// Unlike [`Session::state`] this is readable while the session itself is
    /// moved into `recreate`.
    pub fn state_of(&self, id: &str) -> Option<SessionState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    /// Cheap liveness probe. Any failure marks the session Dead.
    pub async fn is_alive(&self, session: &mut Session) -> bool {
        if session.state != SessionState::Active {
            return false;
        }
        match session.backend.current_address().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Session {} is dead: {e}", session.id);
                session.state = SessionState::Dead;
                self.publish(&session.id, Some(SessionState::Dead));
                false
            }
        }
    }

    /// Replace the session's backend with a fresh one.
    ///
    /// The state is `Recreating` until the replacement is up. The old backend
    /// is closed first and close errors are ignored. Fails only when launching
    /// the replacement fails after the bounded retry; the session is gone then.
    pub async fn recreate(&self, session: Session) -> Result<Session, SessionError> {
        let Session {
            id,
            generation,
            backend,
            ..
        } = session;
        tracing::info!("Recreating session {id} (generation {generation})");
        self.publish(&id, Some(SessionState::Recreating));

        if let Err(e) = backend.close().await {
            tracing::debug!("Ignoring close error on {id}: {e}");
        }

        let backend = match self.launch().await {
            Ok(backend) => backend,
            Err(e) => {
                self.publish(&id, None);
                return Err(e);
            }
        };
        self.publish(&id, Some(SessionState::Active));
        let session = Session::new(id, generation + 1, backend);
        tracing::info!(
            "Session {} recreated at generation {}",
            session.id,
            session.generation
        );
        Ok(session)
    }

    /// Release the session.
    pub async fn close(&self, session: Session) {
        let id = session.id;
        self.publish(&id, None);
        if let Err(e) = session.backend.close().await {
            tracing::debug!("Close error on {id}: {e}");
        }
        tracing::debug!("Closed session {id}");
    }

    fn publish(&self, id: &str, state: Option<SessionState>) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(state) => {
                states.insert(id.to_string(), state);
            }
            None => {
                states.remove(id);
            }
        }
    }

    async fn launch(&self) -> Result<Box<dyn DocumentSession>, SessionError> {
        let attempts = self.create_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.launcher.launch().await {
                Ok(backend) => return Ok(backend),
                Err(e) => {
                    tracing::warn!("Session launch attempt {attempt}/{attempts} failed: {e}");
                    last = e.to_string();
                }
            }
            if attempt < attempts && !self.create_backoff.is_zero() {
                tokio::time::sleep(self.create_backoff).await;
            }
        }

        Err(SessionError::Fatal {
            attempts,
            reason: last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fixture::{FixtureLauncher, FixtureSite};
    use crate::error::DocumentError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// Parks a launch until released once `hold` is set.
    struct GatedLauncher {
        inner: FixtureLauncher,
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SessionLauncher for GatedLauncher {
        async fn launch(&self) -> Result<Box<dyn DocumentSession>, DocumentError> {
            if self.hold.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.launch().await
        }
    }

    fn manager(site: &FixtureSite) -> SessionManager {
        SessionManager::new(Arc::new(site.launcher())).with_retry(2, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let site = FixtureSite::new();
        let mgr = manager(&site);
        let a = mgr.create().await.unwrap();
        let b = mgr.create().await.unwrap();
        assert_eq!(a.id(), "sess-1");
        assert_eq!(b.id(), "sess-2");
        assert_eq!(a.state(), SessionState::Active);
        assert_eq!(a.generation(), 0);
    }

    #[tokio::test]
    async fn test_dead_session_is_recreated() {
        let site = FixtureSite::new();
        let mgr = manager(&site);
        let mut session = mgr.create().await.unwrap();
        assert!(mgr.is_alive(&mut session).await);

        site.kill_sessions();
        assert!(!mgr.is_alive(&mut session).await);
        assert_eq!(session.state(), SessionState::Dead);

        let mut session = mgr.recreate(session).await.unwrap();
        assert_eq!(session.id(), "sess-1");
        assert_eq!(session.generation(), 1);
        assert_eq!(session.state(), SessionState::Active);
        assert!(mgr.is_alive(&mut session).await);
        assert_eq!(site.close_count(), 1);
    }

    #[tokio::test]
    async fn test_create_is_fatal_after_bounded_retry() {
        let site = FixtureSite::new();
        site.fail_launches(5);
        let mgr = manager(&site);

        let err = mgr.create().await.unwrap_err();
        assert!(matches!(err, SessionError::Fatal { attempts: 2, .. }));
        assert_eq!(site.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_create_recovers_within_budget() {
        let site = FixtureSite::new();
        site.fail_launches(1);
        let mgr = manager(&site);
        assert!(mgr.create().await.is_ok());
        assert_eq!(site.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_recreate_fatal() {
        let site = FixtureSite::new();
        let mgr = manager(&site);
        let session = mgr.create().await.unwrap();
        site.fail_launches(2);
        assert!(mgr.recreate(session).await.is_err());
        assert_eq!(mgr.state_of("sess-1"), None);
    }

    #[tokio::test]
    async fn test_state_is_recreating_while_relaunching() {
        let site = FixtureSite::new();
        let launcher = Arc::new(GatedLauncher {
            inner: site.launcher(),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let mgr = Arc::new(
            SessionManager::new(launcher.clone()).with_retry(1, Duration::ZERO),
        );

        let mut session = mgr.create().await.unwrap();
        assert_eq!(mgr.state_of("sess-1"), Some(SessionState::Active));
        site.kill_sessions();
        assert!(!mgr.is_alive(&mut session).await);
        assert_eq!(mgr.state_of("sess-1"), Some(SessionState::Dead));

        launcher.hold.store(true, Ordering::SeqCst);
        let task = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.recreate(session).await }
        });
        launcher.entered.notified().await;
        assert_eq!(mgr.state_of("sess-1"), Some(SessionState::Recreating));

        launcher.release.notify_one();
        let session = task.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(mgr.state_of("sess-1"), Some(SessionState::Active));

        mgr.close(session).await;
        assert_eq!(mgr.state_of("sess-1"), None);
    }
}
