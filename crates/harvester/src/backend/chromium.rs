//! Chromium-backed document sessions using chromiumoxide.
//!
//! Each session owns one headless browser with a single page. Queries run as
//! evaluated scripts; located nodes are remembered in a page-side registry
//! (a plain JS object on `window`, the DOM itself is never written) so later
//! scoped queries and actions can refer back to them by index.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;

use crate::document::{
    normalize_whitespace, DocumentAction, DocumentSession, Element, ElementHandle, Selector,
    SessionLauncher,
};
use crate::error::DocumentError;

/// Find a Chromium binary on the system.
///
/// Checks `~/.harvest/chromium/` and then the usual executable names on `PATH`.
/// Returns `None` when nothing is found, in which case chromiumoxide's own
/// detection is used at launch.
pub fn find_chromium() -> Option<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        let candidates = [
            home.join(".harvest/chromium/chrome-linux64/chrome"),
            home.join(".harvest/chromium/chrome"),
        ];
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Launch settings for [`ChromiumLauncher`].
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    /// Explicit browser executable. Falls back to [`find_chromium`].
    pub executable: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    /// Upper bound on a single query or action script.
    pub query_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: None,
            window_width: 1920,
            window_height: 1080,
            query_timeout: Duration::from_secs(5),
            extra_args: Vec::new(),
        }
    }
}

/// Launches one headless Chromium per session.
pub struct ChromiumLauncher {
    options: ChromiumOptions,
}

impl ChromiumLauncher {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }

    fn browser_config(&self) -> Result<BrowserConfig, DocumentError> {
        let opts = &self.options;
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg(format!(
                "--window-size={},{}",
                opts.window_width, opts.window_height
            ));
        for arg in &opts.extra_args {
            builder = builder.arg(arg.clone());
        }
        if let Some(path) = opts.executable.clone().or_else(find_chromium) {
            builder = builder.chrome_executable(path);
        }
        builder
            .build()
            .map_err(|e| DocumentError::Disconnected(format!("failed to build browser config: {e}")))
    }
}

impl Default for ChromiumLauncher {
    fn default() -> Self {
        Self::new(ChromiumOptions::default())
    }
}

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn DocumentSession>, DocumentError> {
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DocumentError::Disconnected(format!("failed to launch Chromium: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(DocumentError::Disconnected(format!(
                    "failed to create page: {e}"
                )));
            }
        };

        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler,
            generation: 0,
            query_timeout: self.options.query_timeout,
        }))
    }
}

/// A single browser with one page.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler: tokio::task::JoinHandle<()>,
    generation: u32,
    query_timeout: Duration,
}

#[derive(Deserialize)]
struct QueryReply {
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    items: Vec<NodeSnapshot>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    syntax: bool,
}

#[derive(Deserialize)]
struct NodeSnapshot {
    node: u32,
    tag: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl ChromiumSession {
    async fn evaluate<T: serde::de::DeserializeOwned>(
        &self,
        script: String,
    ) -> Result<T, DocumentError> {
        let result = tokio::time::timeout(self.query_timeout, self.page.evaluate(script))
            .await
            .map_err(|_| DocumentError::Timeout(self.query_timeout))?
            .map_err(|e| DocumentError::Disconnected(format!("evaluate failed: {e}")))?;
        result
            .into_value()
            .map_err(|e| DocumentError::Script(format!("failed to convert JS result: {e:?}")))
    }

    fn check_generation(&self, handle: &ElementHandle) -> Result<(), DocumentError> {
        if handle.page == self.generation {
            Ok(())
        } else {
            Err(DocumentError::Stale(handle.to_string()))
        }
    }

    async fn query(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
        all: bool,
    ) -> Result<Vec<Element>, DocumentError> {
        if let Some(handle) = scope {
            self.check_generation(handle)?;
        }
        let script = query_script(selector, scope.map(|h| h.node), all)?;
        let reply: QueryReply = self.evaluate(script).await?;

        if reply.stale {
            let handle = scope.map(|h| h.to_string()).unwrap_or_default();
            return Err(DocumentError::Stale(handle));
        }
        if let Some(reason) = reply.error {
            return Err(if reply.syntax {
                DocumentError::InvalidSelector {
                    selector: selector.clone(),
                    reason,
                }
            } else {
                DocumentError::Script(reason)
            });
        }

        let generation = self.generation;
        Ok(reply
            .items
            .into_iter()
            .map(|n| Element {
                handle: ElementHandle::new(generation, n.node),
                tag: n.tag,
                text: normalize_whitespace(&n.text),
                html: n.html,
                attributes: n.attributes,
            })
            .collect())
    }
}

#[async_trait]
impl DocumentSession for ChromiumSession {
    async fn open(&mut self, address: &str, timeout: Duration) -> Result<(), DocumentError> {
        // Whatever happens below, handles from the previous document are gone.
        self.generation += 1;
        match tokio::time::timeout(timeout, self.page.goto(address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DocumentError::Load {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DocumentError::Timeout(timeout)),
        }
    }

    async fn current_address(&self) -> Result<String, DocumentError> {
        let url = tokio::time::timeout(self.query_timeout, self.page.url())
            .await
            .map_err(|_| DocumentError::Disconnected("address probe timed out".into()))?
            .map_err(|e| DocumentError::Disconnected(format!("failed to get URL: {e}")))?;
        Ok(url.map(|u| u.to_string()).unwrap_or_default())
    }

    async fn find(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Element, DocumentError> {
        self.query(selector, scope, false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DocumentError::NotFound(selector.clone()))
    }

    async fn find_all(
        &self,
        selector: &Selector,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<Element>, DocumentError> {
        self.query(selector, scope, true).await
    }

    async fn run_action(
        &self,
        action: DocumentAction,
        target: &ElementHandle,
    ) -> Result<(), DocumentError> {
        self.check_generation(target)?;
        let reply: QueryReply = self.evaluate(action_script(action, target.node)).await?;
        if reply.stale {
            return Err(DocumentError::Stale(target.to_string()));
        }
        match reply.error {
            Some(reason) => Err(DocumentError::Script(reason)),
            None => Ok(()),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), DocumentError> {
        let mut this = *self;
        let _ = this.page.close().await;
        let _ = this.browser.close().await;
        let _ = this.browser.wait().await;
        this.handler.abort();
        Ok(())
    }
}

const REGISTRY: &str = "const reg = window.__harvest || (window.__harvest = { nodes: [] });";

fn query_script(
    selector: &Selector,
    scope: Option<u32>,
    all: bool,
) -> Result<String, DocumentError> {
    let expr = serde_json::to_string(selector.expression())
        .map_err(|e| DocumentError::Script(e.to_string()))?;
    let dialect = match selector {
        Selector::Css(_) => "css",
        Selector::XPath(_) => "xpath",
    };
    let scope = scope.map_or_else(|| "null".to_string(), |n| n.to_string());

    Ok(format!(
        r#"(() => {{
  {REGISTRY}
  const expr = {expr};
  const scope = {scope};
  const all = {all};
  try {{
    let root = document;
    if (scope !== null) {{
      root = reg.nodes[scope];
      if (!root || !root.isConnected) return {{ stale: true, items: [] }};
    }}
    let found = [];
    if ("{dialect}" === "css") {{
      found = all ? Array.from(root.querySelectorAll(expr)) : [root.querySelector(expr)].filter(Boolean);
    }} else {{
      const snap = document.evaluate(expr, root, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
      for (let i = 0; i < snap.snapshotLength; i++) {{
        const n = snap.snapshotItem(i);
        if (n.nodeType === 1) found.push(n);
      }}
      if (!all) found = found.slice(0, 1);
    }}
    const items = found.map(el => {{
      let idx = reg.nodes.indexOf(el);
      if (idx < 0) {{ idx = reg.nodes.length; reg.nodes.push(el); }}
      const attributes = {{}};
      for (const a of el.attributes) attributes[a.name] = a.value;
      return {{ node: idx, tag: el.tagName.toLowerCase(), text: el.innerText ?? el.textContent ?? "", html: el.innerHTML, attributes }};
    }});
    return {{ stale: false, items }};
  }} catch (e) {{
    return {{ error: String((e && e.message) || e), syntax: !!e && e.name === "SyntaxError" }};
  }}
}})()"#
    ))
}

fn action_script(action: DocumentAction, node: u32) -> String {
    let call = match action {
        DocumentAction::Click => "el.click();",
        DocumentAction::ScrollIntoView => "el.scrollIntoView({ block: \"center\" });",
    };
    format!(
        r#"(() => {{
  {REGISTRY}
  const el = reg.nodes[{node}];
  if (!el || !el.isConnected) return {{ stale: true }};
  try {{ {call} return {{ stale: false }}; }}
  catch (e) {{ return {{ error: String((e && e.message) || e) }}; }}
}})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_script_escapes_selector() {
        let script = query_script(&Selector::css(r#"a[title="x"]"#), Some(4), true).unwrap();
        assert!(script.contains(r#"const expr = "a[title=\"x\"]";"#));
        assert!(script.contains("const scope = 4;"));
        assert!(script.contains("const all = true;"));
    }

    #[test]
    fn test_action_script_targets_registry_slot() {
        let script = action_script(DocumentAction::Click, 7);
        assert!(script.contains("reg.nodes[7]"));
        assert!(script.contains("el.click();"));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_open_and_query() {
        let launcher = ChromiumLauncher::default();
        let mut session = launcher.launch().await.expect("failed to launch");

        session
            .open(
                "data:text/html,<aside><h2>Hello</h2></aside><p>World</p>",
                Duration::from_secs(10),
            )
            .await
            .expect("navigation failed");

        let aside = session
            .find(&Selector::css("aside"), None)
            .await
            .expect("aside missing");
        let heading = session
            .find(&Selector::xpath(".//h2"), Some(&aside.handle))
            .await
            .expect("heading missing");
        assert_eq!(heading.text, "Hello");

        let missing = session.find(&Selector::css("p"), Some(&aside.handle)).await;
        assert!(matches!(missing, Err(DocumentError::NotFound(_))));

        session
            .run_action(DocumentAction::Click, &heading.handle)
            .await
            .expect("click failed");
        session.close().await.expect("close failed");
    }
}
