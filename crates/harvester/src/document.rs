//! Document Session abstraction.
//!
//! Defines the `SessionLauncher` and `DocumentSession` traits that abstract over
//! the browser engine (Chromium via chromiumoxide, or the offline fixture backend).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DocumentError;

/// A node query in one of the supported dialects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Css(String),
    #[serde(rename = "xpath")]
    XPath(String),
}

impl Selector {
    pub fn css(s: impl Into<String>) -> Self {
        Selector::Css(s.into())
    }

    pub fn xpath(s: impl Into<String>) -> Self {
        Selector::XPath(s.into())
    }

    pub fn expression(&self) -> &str {
        match self {
            Selector::Css(s) | Selector::XPath(s) => s,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(s) => write!(f, "css `{s}`"),
            Selector::XPath(s) => write!(f, "xpath `{s}`"),
        }
    }
}

/// Opaque reference to a node, valid only for the navigation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle {
    /// Navigation generation of the session when the node was located.
    pub page: u32,
    /// Backend-specific node index within that page.
    pub node: u32,
}

impl ElementHandle {
    pub fn new(page: u32, node: u32) -> Self {
        Self { page, node }
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}:n{}", self.page, self.node)
    }
}

/// Snapshot of a located node. Reading fields never touches the live document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub handle: ElementHandle,
    /// Lowercase tag name.
    pub tag: String,
    /// Rendered text, trimmed.
    pub text: String,
    /// Inner HTML at snapshot time.
    pub html: String,
    pub attributes: BTreeMap<String, String>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Document-mutating actions a unit may run against its own subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAction {
    Click,
    ScrollIntoView,
}

/// A browser engine that can create document sessions.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Launch a fresh session with nothing loaded.
    async fn launch(&self) -> Result<Box<dyn DocumentSession>, DocumentError>;
}

/// A single stateful session exposing one current document at a time.
#[async_trait]
pub trait DocumentSession: Send + Sync {
    /// Load `address`, replacing the current document.
    async fn open(&mut self, address: &str, timeout: Duration) -> Result<(), DocumentError>;
    /// Current address; doubles as the cheap liveness probe.
    async fn current_address(&self) -> Result<String, DocumentError>;
    /// First node matching `selector` (inside `scope` if given).
    async fn find(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Element, DocumentError>;
    /// Every node matching `selector`, in document order. May be empty.
    async fn find_all(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<Element>, DocumentError>;
    /// Run an action against `target`.
    async fn run_action(
        &self,
        action: DocumentAction,
        target: &ElementHandle,
    ) -> Result<(), DocumentError>;
    /// Release the session.
    async fn close(self: Box<Self>) -> Result<(), DocumentError>;
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
