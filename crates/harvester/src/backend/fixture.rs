//! Offline backend over saved HTML pages.
//!
//! Serves captured documents through the same [`DocumentSession`] surface as the
//! browser backend, evaluated with `scraper` (CSS selectors only). Nothing is
//! rendered, so actions succeed without changing the document.
//!
//! The site handle doubles as a fault injector: loads can fail, selectors can
//! appear only after a number of probes, and sessions can be killed. Counters
//! record every probe, load, launch and close.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html};

use crate::document::{
    normalize_whitespace, DocumentAction, DocumentSession, Element, ElementHandle, Selector,
    SessionLauncher,
};
use crate::error::DocumentError;

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, String>,
    load_failures: HashMap<String, u32>,
    kill_on_open: HashSet<String>,
    hidden: HashMap<Selector, u32>,
    launch_failures: u32,
    sessions: Vec<Arc<AtomicBool>>,
    probes: HashMap<Selector, u32>,
    loads: HashMap<String, u32>,
    launches: u32,
    closes: u32,
    actions: u32,
}

/// A set of saved pages plus injected faults, shared by every session it launches.
#[derive(Clone, Default)]
pub struct FixtureSite {
    state: Arc<Mutex<SiteState>>,
}

impl FixtureSite {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builder-style [`add_page`](Self::add_page).
    pub fn with_page(self, address: &str, html: &str) -> Self {
        self.add_page(address, html);
        self
    }

    pub fn add_page(&self, address: &str, html: &str) {
        self.state()
            .pages
            .insert(address.to_string(), html.to_string());
    }

    /// Load every `*.html` file in `dir` under the address `{prefix}{file stem}`.
    pub fn from_dir(dir: &std::path::Path, prefix: &str) -> std::io::Result<Self> {
        let site = Self::new();
        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let html = std::fs::read_to_string(&path)?;
                site.add_page(&format!("{prefix}{stem}"), &html);
            }
        }
        Ok(site)
    }

    /// The next `times` loads of `address` fail.
    pub fn fail_loads(&self, address: &str, times: u32) {
        self.state()
            .load_failures
            .insert(address.to_string(), times);
    }

    /// The next session to open `address` dies while loading it.
    pub fn kill_on_open(&self, address: &str) {
        self.state().kill_on_open.insert(address.to_string());
    }

    /// `selector` matches nothing for its next `probes` queries.
    pub fn delay_selector(&self, selector: &Selector, probes: u32) {
        self.state().hidden.insert(selector.clone(), probes);
    }

    /// Every session launched so far stops responding.
    pub fn kill_sessions(&self) {
        for alive in &self.state().sessions {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// The next `times` launches fail.
    pub fn fail_launches(&self, times: u32) {
        self.state().launch_failures = times;
    }

    pub fn probe_count(&self, selector: &Selector) -> u32 {
        self.state().probes.get(selector).copied().unwrap_or(0)
    }

    pub fn load_count(&self, address: &str) -> u32 {
        self.state().loads.get(address).copied().unwrap_or(0)
    }

    pub fn launch_count(&self) -> u32 {
        self.state().launches
    }

    pub fn close_count(&self) -> u32 {
        self.state().closes
    }

    pub fn action_count(&self) -> u32 {
        self.state().actions
    }

    pub fn launcher(&self) -> FixtureLauncher {
        FixtureLauncher { site: self.clone() }
    }
}

/// Launches [`FixtureSession`]s over a [`FixtureSite`].
#[derive(Clone)]
pub struct FixtureLauncher {
    site: FixtureSite,
}

#[async_trait]
impl SessionLauncher for FixtureLauncher {
    async fn launch(&self) -> Result<Box<dyn DocumentSession>, DocumentError> {
        let mut state = self.site.state();
        state.launches += 1;
        if state.launch_failures > 0 {
            state.launch_failures -= 1;
            return Err(DocumentError::Disconnected("fixture launch refused".into()));
        }
        let alive = Arc::new(AtomicBool::new(true));
        state.sessions.push(Arc::clone(&alive));
        Ok(Box::new(FixtureSession {
            site: self.site.clone(),
            alive,
            current: None,
            generation: 0,
        }))
    }
}

struct LoadedPage {
    address: String,
    html: String,
    generation: u32,
}

/// One session over a fixture site.
pub struct FixtureSession {
    site: FixtureSite,
    alive: Arc<AtomicBool>,
    current: Option<LoadedPage>,
    generation: u32,
}

impl FixtureSession {
    fn ensure_alive(&self) -> Result<(), DocumentError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DocumentError::Disconnected("fixture session killed".into()))
        }
    }

    fn page(&self) -> Result<&LoadedPage, DocumentError> {
        self.current.as_ref().ok_or(DocumentError::NoDocument)
    }

    fn query(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<Element>, DocumentError> {
        {
            let mut state = self.site.state();
            *state.probes.entry(selector.clone()).or_insert(0) += 1;
            self.ensure_alive()?;
            if let Some(remaining) = state.hidden.get_mut(selector) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(Vec::new());
                }
            }
        }

        let page = self.page()?;
        let css = match selector {
            Selector::Css(expr) => expr,
            Selector::XPath(_) => {
                return Err(DocumentError::Unsupported(
                    "xpath selectors need a rendering backend".into(),
                ))
            }
        };
        let compiled =
            scraper::Selector::parse(css).map_err(|e| DocumentError::InvalidSelector {
                selector: selector.clone(),
                reason: format!("{e:?}"),
            })?;

        let html = Html::parse_document(&page.html);
        let matches: Vec<ElementRef<'_>> = match scope {
            Some(handle) => resolve(&html, page.generation, handle)?
                .select(&compiled)
                .collect(),
            None => html.select(&compiled).collect(),
        };

        Ok(matches
            .into_iter()
            .filter_map(|el| {
                node_index(&html, &el).map(|idx| snapshot(el, page.generation, idx))
            })
            .collect())
    }
}

#[async_trait]
impl DocumentSession for FixtureSession {
    async fn open(&mut self, address: &str, _timeout: Duration) -> Result<(), DocumentError> {
        self.ensure_alive()?;
        let html = {
            let mut state = self.site.state();
            *state.loads.entry(address.to_string()).or_insert(0) += 1;
            if state.kill_on_open.remove(address) {
                self.alive.store(false, Ordering::SeqCst);
                return Err(DocumentError::Disconnected(format!(
                    "fixture session died loading {address}"
                )));
            }
            if let Some(remaining) = state.load_failures.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DocumentError::Load {
                        address: address.to_string(),
                        reason: "injected load failure".into(),
                    });
                }
            }
            state.pages.get(address).cloned()
        };

        // A failed load leaves no usable document behind.
        self.generation += 1;
        match html {
            Some(html) => {
                self.current = Some(LoadedPage {
                    address: address.to_string(),
                    html,
                    generation: self.generation,
                });
                Ok(())
            }
            None => {
                self.current = None;
                Err(DocumentError::Load {
                    address: address.to_string(),
                    reason: "404 not found".into(),
                })
            }
        }
    }

    async fn current_address(&self) -> Result<String, DocumentError> {
        self.ensure_alive()?;
        Ok(self
            .current
            .as_ref()
            .map(|p| p.address.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn find(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Element, DocumentError> {
        self.query(selector, scope)?
            .into_iter()
            .next()
            .ok_or_else(|| DocumentError::NotFound(selector.clone()))
    }

    async fn find_all(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<Element>, DocumentError> {
        self.query(selector, scope)
    }

    async fn run_action(
        &self,
        _action: DocumentAction,
        target: &ElementHandle,
    ) -> Result<(), DocumentError> {
        self.ensure_alive()?;
        let page = self.page()?;
        let html = Html::parse_document(&page.html);
        resolve(&html, page.generation, target)?;
        self.site.state().actions += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DocumentError> {
        self.alive.store(false, Ordering::SeqCst);
        self.site.state().closes += 1;
        Ok(())
    }
}

/// Pre-order position of `el` in the parsed tree. Stable across re-parses.
fn node_index(html: &Html, el: &ElementRef<'_>) -> Option<u32> {
    html.tree
        .root()
        .descendants()
        .position(|n| n.id() == el.id())
        .map(|i| i as u32)
}

fn resolve<'h>(
    html: &'h Html,
    generation: u32,
    handle: &ElementHandle,
) -> Result<ElementRef<'h>, DocumentError> {
    if handle.page != generation {
        return Err(DocumentError::Stale(handle.to_string()));
    }
    html.tree
        .root()
        .descendants()
        .nth(handle.node as usize)
        .and_then(ElementRef::wrap)
        .ok_or_else(|| DocumentError::Stale(handle.to_string()))
}

fn snapshot(el: ElementRef<'_>, generation: u32, index: u32) -> Element {
    Element {
        handle: ElementHandle::new(generation, index),
        tag: el.value().name().to_ascii_lowercase(),
        text: normalize_whitespace(&el.text().collect::<String>()),
        html: el.inner_html(),
        attributes: el
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}
