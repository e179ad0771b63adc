//! Configuration-driven extractor units.
//!
//! An [`ExtractorSpec`] describes how to read one field out of a document
//! (or out of a scope element inside it). Specs nest: `repeated`, `group`
//! and `keyed` evaluate child specs inside each element they locate. A
//! [`ConfiguredUnit`] wraps a spec as a pipeline [`ExtractorUnit`] that emits
//! a single top-level field.
//!
//! Every read goes through the document's [`Locator`]. Lookups against the
//! document or a freshly expanded region use the locator's default retry
//! policy; reads of cells inside an element that was already located use a
//! single probe.

pub mod materials;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::document::{DocumentAction, Element, Selector};
use crate::error::ExtractionError;
use crate::locator::{Locator, RetryPolicy};
use crate::pipeline::ExtractorUnit;
use crate::session::Document;
use crate::value::{FieldMap, FieldValue, PartialRecord};

use self::materials::{image_name, pair_materials, strip_image_extension};

/// How to read one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorSpec {
    /// Text of the first match, or of the scope element itself when no
    /// selector is given.
    Text {
        #[serde(default)]
        selector: Option<Selector>,
        #[serde(default)]
        required: bool,
    },

    /// An attribute of the first match.
    Attribute {
        selector: Selector,
        attribute: String,
        #[serde(default)]
        strip_extension: bool,
        #[serde(default)]
        required: bool,
    },

    /// Texts of every match, empties dropped.
    List { selector: Selector },

    /// Label/value rows into a mapping keyed by normalized label.
    KeyValue {
        row: Selector,
        label: Selector,
        value: Selector,
        /// When it matches inside a value, the value becomes a list.
        #[serde(default)]
        list_item: Option<Selector>,
        /// Rows whose label contains any of these are skipped.
        #[serde(default)]
        exclude: Vec<String>,
    },

    /// Header-keyed rows of named columns.
    Table {
        #[serde(default)]
        table: Option<Selector>,
        row: Selector,
        header: Selector,
        cell: Selector,
        columns: Vec<String>,
        #[serde(default)]
        skip_rows: usize,
    },

    /// One cell per row, keyed `"{prefix} {n}"`.
    Numbered {
        #[serde(default)]
        table: Option<Selector>,
        row: Selector,
        cell: Selector,
        prefix: String,
        #[serde(default)]
        skip_rows: usize,
        #[serde(default)]
        skip_if_contains: Vec<String>,
        /// Rows matching `skip_if_contains` are kept if they also contain one of these.
        #[serde(default)]
        keep_if_contains: Vec<String>,
        /// Value recorded under the first number before any row is read.
        #[serde(default)]
        seed: Option<String>,
    },

    /// One mapping per matching item.
    Repeated {
        item: Selector,
        #[serde(default)]
        expand: Option<Expand>,
        fields: Vec<FieldSpec>,
        /// Items lacking this field are dropped.
        #[serde(default)]
        require_field: Option<String>,
    },

    /// A mapping of fields read inside one container.
    Group {
        #[serde(default)]
        container: Option<Selector>,
        #[serde(default)]
        expand: Option<Expand>,
        fields: Vec<FieldSpec>,
    },

    /// A mapping keyed by each item's normalized heading.
    Keyed {
        item: Selector,
        key: Selector,
        #[serde(default)]
        exclude: Vec<String>,
        value: Box<ExtractorSpec>,
    },

    /// Table rows as mappings of column name to cell text.
    Rows {
        #[serde(default)]
        table: Option<Selector>,
        row: Selector,
        cell: Selector,
        columns: Vec<String>,
        #[serde(default)]
        skip_rows: usize,
        #[serde(default)]
        min_cells: usize,
        #[serde(default)]
        row_labels: Option<RowLabels>,
    },

    /// Material name/quantity pairs read from images and surrounding text.
    Materials {
        #[serde(default)]
        container: Option<Selector>,
        #[serde(default = "default_image_selector")]
        image: Selector,
        #[serde(default = "default_ignored_images")]
        ignore_images_containing: Vec<String>,
    },
}

fn default_image_selector() -> Selector {
    Selector::css("img")
}

fn default_ignored_images() -> Vec<String> {
    vec!["icon".to_string()]
}

/// A named child spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub spec: ExtractorSpec,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, spec: ExtractorSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

/// Click a toggle before reading, optionally only when its text matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expand {
    pub toggle: Selector,
    #[serde(default)]
    pub when_text_contains: Option<String>,
}

/// Generated row labels: `1..=numeric`, then `{mastery_prefix}1..`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLabels {
    #[serde(default = "default_label_field")]
    pub field: String,
    #[serde(default = "default_numeric_levels")]
    pub numeric: usize,
    #[serde(default = "default_mastery_prefix")]
    pub mastery_prefix: String,
}

fn default_label_field() -> String {
    "level".to_string()
}

fn default_numeric_levels() -> usize {
    7
}

fn default_mastery_prefix() -> String {
    "M".to_string()
}

impl Default for RowLabels {
    fn default() -> Self {
        Self {
            field: default_label_field(),
            numeric: default_numeric_levels(),
            mastery_prefix: default_mastery_prefix(),
        }
    }
}

impl RowLabels {
    pub fn label(&self, index: usize) -> String {
        if index < self.numeric {
            (index + 1).to_string()
        } else {
            format!("{}{}", self.mastery_prefix, index + 1 - self.numeric)
        }
    }
}

/// Lowercase, spaces and `/` to `_`, dots removed.
pub fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .replace(' ', "_")
        .replace('.', "")
        .replace('/', "_")
}

/// An [`ExtractorUnit`] declared from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredUnit {
    pub name: String,
    /// Output field; defaults to the unit name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(flatten)]
    pub spec: ExtractorSpec,
}

impl ConfiguredUnit {
    pub fn new(name: impl Into<String>, spec: ExtractorSpec) -> Self {
        Self {
            name: name.into(),
            field: None,
            spec,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn field_name(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }
}

#[async_trait]
impl ExtractorUnit for ConfiguredUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, doc: &Document<'_>) -> Result<PartialRecord, ExtractionError> {
        let mut record = PartialRecord::new();
        if let Some(value) = evaluate(&self.spec, *doc.locator(), None).await? {
            if !value.is_empty() {
                record.insert(self.field_name(), value);
            }
        }
        Ok(record)
    }
}

/// Single probe for reads inside an element that is already present.
fn settled() -> RetryPolicy {
    RetryPolicy::optional(1, Duration::ZERO)
}

fn optional(loc: &Locator<'_>) -> RetryPolicy {
    loc.policy().with_required(false)
}

/// Where a spec reads from.
enum Root {
    /// The container selector matched nothing.
    Missing,
    /// `None` is the whole document.
    At(Option<Element>),
}

async fn descend(
    loc: &Locator<'_>,
    container: Option<&Selector>,
    scope: Option<&Element>,
) -> Result<Root, ExtractionError> {
    match container {
        Some(sel) => Ok(match loc.locate(sel, scope, optional(loc)).await? {
            Some(el) => Root::At(Some(el)),
            None => Root::Missing,
        }),
        None => Ok(Root::At(scope.cloned())),
    }
}

/// Evaluate `spec` inside `scope` (the whole document when `None`).
///
/// `Ok(None)` means nothing was found and the field should be left out.
pub fn evaluate<'a>(
    spec: &'a ExtractorSpec,
    loc: Locator<'a>,
    scope: Option<&'a Element>,
) -> BoxFuture<'a, Result<Option<FieldValue>, ExtractionError>> {
    async move {
        match spec {
            ExtractorSpec::Text { selector, required } => {
                let el = match selector {
                    Some(sel) => {
                        loc.locate(sel, scope, loc.policy().with_required(*required))
                            .await?
                    }
                    None => scope.cloned(),
                };
                Ok(el
                    .map(|e| e.text)
                    .filter(|t| !t.is_empty())
                    .map(FieldValue::Text))
            }

            ExtractorSpec::Attribute {
                selector,
                attribute,
                strip_extension,
                required,
            } => {
                let el = loc
                    .locate(selector, scope, loc.policy().with_required(*required))
                    .await?;
                Ok(el
                    .and_then(|e| e.attr(attribute).map(str::to_string))
                    .map(|v| {
                        if *strip_extension {
                            strip_image_extension(&v).to_string()
                        } else {
                            v
                        }
                    })
                    .filter(|v| !v.is_empty())
                    .map(FieldValue::Text))
            }

            ExtractorSpec::List { selector } => {
                let texts: Vec<FieldValue> = loc
                    .locate_all(selector, scope, optional(&loc))
                    .await?
                    .into_iter()
                    .filter(|e| !e.text.is_empty())
                    .map(|e| FieldValue::Text(e.text))
                    .collect();
                Ok(non_empty_list(texts))
            }

            ExtractorSpec::KeyValue {
                row,
                label,
                value,
                list_item,
                exclude,
            } => key_value(&loc, scope, row, label, value, list_item.as_ref(), exclude).await,

            ExtractorSpec::Table {
                table,
                row,
                header,
                cell,
                columns,
                skip_rows,
            } => {
                let rows = match rows_of(&loc, table.as_ref(), scope, row, *skip_rows).await? {
                    Some(rows) => rows,
                    None => return Ok(None),
                };
                let mut map = FieldMap::new();
                for r in &rows {
                    let Some(head) = loc.locate(header, Some(r), settled()).await? else {
                        continue;
                    };
                    let cells = loc.locate_all(cell, Some(r), settled()).await?;
                    let entry: FieldMap = columns
                        .iter()
                        .enumerate()
                        .map(|(i, col)| {
                            let text = cells.get(i).map(|c| c.text.clone()).unwrap_or_default();
                            (col.clone(), FieldValue::Text(text))
                        })
                        .collect();
                    map.insert(head.text, entry);
                }
                Ok(non_empty_map(map))
            }

            ExtractorSpec::Numbered {
                table,
                row,
                cell,
                prefix,
                skip_rows,
                skip_if_contains,
                keep_if_contains,
                seed,
            } => {
                let mut map = FieldMap::new();
                let mut n = 1;
                if let Some(seed) = seed {
                    map.insert(format!("{prefix} {n}"), seed.as_str());
                    n += 1;
                }
                let rows = rows_of(&loc, table.as_ref(), scope, row, *skip_rows)
                    .await?
                    .unwrap_or_default();
                for r in &rows {
                    let skip = skip_if_contains.iter().any(|s| r.text.contains(s.as_str()))
                        && !keep_if_contains.iter().any(|s| r.text.contains(s.as_str()));
                    if skip {
                        continue;
                    }
                    if let Some(c) = loc.locate(cell, Some(r), settled()).await? {
                        map.insert(format!("{prefix} {n}"), c.text);
                        n += 1;
                    }
                }
                // A seed alone is not a finding.
                let found = map.len() > usize::from(seed.is_some());
                Ok(if found { Some(FieldValue::Map(map)) } else { None })
            }

            ExtractorSpec::Repeated {
                item,
                expand,
                fields,
                require_field,
            } => {
                let items = loc.locate_all(item, scope, optional(&loc)).await?;
                let mut out = Vec::new();
                for it in &items {
                    if let Some(expand) = expand {
                        run_expand(&loc, expand, Some(it)).await?;
                    }
                    let map = evaluate_fields(fields, loc, Some(it)).await?;
                    if let Some(required) = require_field {
                        if !map.contains_key(required) {
                            continue;
                        }
                    }
                    if !map.is_empty() {
                        out.push(FieldValue::Map(map));
                    }
                }
                Ok(non_empty_list(out))
            }

            ExtractorSpec::Group {
                container,
                expand,
                fields,
            } => {
                if let Some(expand) = expand {
                    run_expand(&loc, expand, scope).await?;
                }
                match descend(&loc, container.as_ref(), scope).await? {
                    Root::Missing => Ok(None),
                    Root::At(root) => {
                        let map = evaluate_fields(fields, loc, root.as_ref()).await?;
                        Ok(non_empty_map(map))
                    }
                }
            }

            ExtractorSpec::Keyed {
                item,
                key,
                exclude,
                value,
            } => {
                let items = loc.locate_all(item, scope, optional(&loc)).await?;
                let mut map = FieldMap::new();
                for it in &items {
                    let Some(k) = loc.locate(key, Some(it), settled()).await? else {
                        continue;
                    };
                    if is_excluded(&k.text, exclude) {
                        continue;
                    }
                    if let Some(v) = evaluate(value, loc, Some(it)).await? {
                        if !v.is_empty() {
                            map.insert(normalize_label(&k.text), v);
                        }
                    }
                }
                Ok(non_empty_map(map))
            }

            ExtractorSpec::Rows {
                table,
                row,
                cell,
                columns,
                skip_rows,
                min_cells,
                row_labels,
            } => {
                let rows = rows_of(&loc, table.as_ref(), scope, row, *skip_rows)
                    .await?
                    .unwrap_or_default();
                let mut out = Vec::new();
                for (index, r) in rows.iter().enumerate() {
                    let cells = loc.locate_all(cell, Some(r), settled()).await?;
                    if cells.len() < *min_cells {
                        continue;
                    }
                    let mut map = FieldMap::new();
                    if let Some(labels) = row_labels {
                        map.insert(labels.field.as_str(), labels.label(index));
                    }
                    for (i, col) in columns.iter().enumerate() {
                        let text = cells.get(i).map(|c| c.text.clone()).unwrap_or_default();
                        map.insert(col.as_str(), text);
                    }
                    out.push(FieldValue::Map(map));
                }
                Ok(non_empty_list(out))
            }

            ExtractorSpec::Materials {
                container,
                image,
                ignore_images_containing,
            } => {
                let root = match descend(&loc, container.as_ref(), scope).await? {
                    Root::At(Some(el)) => el,
                    _ => return Ok(None),
                };
                let names: Vec<String> = loc
                    .locate_all(image, Some(&root), settled())
                    .await?
                    .iter()
                    .filter_map(|img| image_name(img, ignore_images_containing))
                    .collect();
                let materials = pair_materials(&root.text, &names)
                    .into_iter()
                    .map(FieldValue::from)
                    .collect();
                Ok(non_empty_list(materials))
            }
        }
    }
    .boxed()
}

async fn evaluate_fields(
    fields: &[FieldSpec],
    loc: Locator<'_>,
    scope: Option<&Element>,
) -> Result<FieldMap, ExtractionError> {
    let mut map = FieldMap::new();
    for field in fields {
        if let Some(v) = evaluate(&field.spec, loc, scope).await? {
            map.insert(field.name.as_str(), v);
        }
    }
    Ok(map)
}

async fn key_value(
    loc: &Locator<'_>,
    scope: Option<&Element>,
    row: &Selector,
    label: &Selector,
    value: &Selector,
    list_item: Option<&Selector>,
    exclude: &[String],
) -> Result<Option<FieldValue>, ExtractionError> {
    let rows = loc.locate_all(row, scope, optional(loc)).await?;
    let mut map = FieldMap::new();
    for r in &rows {
        let Some(l) = loc.locate(label, Some(r), settled()).await? else {
            continue;
        };
        if is_excluded(&l.text, exclude) {
            continue;
        }
        let Some(v) = loc.locate(value, Some(r), settled()).await? else {
            continue;
        };

        let items = match list_item {
            Some(li) => loc.locate_all(li, Some(&v), settled()).await?,
            None => Vec::new(),
        };
        let parsed = if items.is_empty() {
            FieldValue::Text(v.text)
        } else {
            FieldValue::List(items.into_iter().map(|i| FieldValue::Text(i.text)).collect())
        };
        map.insert(normalize_label(&l.text), parsed);
    }
    Ok(non_empty_map(map))
}

/// Rows inside an optional table, after skipping header rows. `None` when the
/// table itself is missing.
async fn rows_of(
    loc: &Locator<'_>,
    table: Option<&Selector>,
    scope: Option<&Element>,
    row: &Selector,
    skip: usize,
) -> Result<Option<Vec<Element>>, ExtractionError> {
    let root = match descend(loc, table, scope).await? {
        Root::Missing => return Ok(None),
        Root::At(root) => root,
    };
    let rows = loc.locate_all(row, root.as_ref(), optional(loc)).await?;
    Ok(Some(rows.into_iter().skip(skip).collect()))
}

async fn run_expand(
    loc: &Locator<'_>,
    expand: &Expand,
    scope: Option<&Element>,
) -> Result<(), ExtractionError> {
    let Some(toggle) = loc.locate(&expand.toggle, scope, settled()).await? else {
        return Ok(());
    };
    let wanted = match &expand.when_text_contains {
        Some(s) => toggle.text.contains(s.as_str()),
        None => true,
    };
    if wanted {
        tracing::debug!("Expanding {} at {}", expand.toggle, toggle.handle);
        loc.act(DocumentAction::Click, &toggle).await?;
    }
    Ok(())
}

fn is_excluded(label: &str, exclude: &[String]) -> bool {
    let label = label.to_lowercase();
    exclude.iter().any(|e| label.contains(&e.to_lowercase()))
}

fn non_empty_list(items: Vec<FieldValue>) -> Option<FieldValue> {
    if items.is_empty() {
        None
    } else {
        Some(FieldValue::List(items))
    }
}

fn non_empty_map(map: FieldMap) -> Option<FieldValue> {
    if map.is_empty() {
        None
    } else {
        Some(FieldValue::Map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::fixture::FixtureSite;
    use crate::session::{Session, SessionManager};

    const OPERATOR: &str = r#"<html><body><div id="mw-content-text"><div>
      <aside class="portable-infobox">
        <div class="pi-item pi-data"><h3>Class</h3><div class="pi-data-value">Specialist</div></div>
        <div class="pi-item pi-data"><h3>Tags</h3><div class="pi-data-value"><ul><li>Support</li><li>DPS</li></ul></div></div>
        <div class="pi-item pi-data"><h3>Ref. No./Code</h3><div class="pi-data-value">AK01</div></div>
        <section class="pi-item pi-group">
          <h2>Voice actors</h2>
          <div class="pi-item pi-data"><h3>JP</h3><div class="pi-data-value">Kaji</div></div>
        </section>
        <section class="pi-item pi-group">
          <h2>Related characters</h2>
          <div class="pi-item pi-data"><h3>Friend</h3><div class="pi-data-value">Someone</div></div>
        </section>
      </aside>
      <table class="stats">
        <tr><th>Attribute</th><th>Base</th><th>Max</th></tr>
        <tr><th>HP</th><td>700</td><td>1000</td></tr>
        <tr><th>ATK</th><td>200</td></tr>
      </table>
      <table class="potential">
        <tr><th>Potential</th><th>Effect</th></tr>
        <tr><td>2</td><td>Deployment Cost -1</td></tr>
        <tr><td>OR</td><td>either</td></tr>
        <tr><td>3</td><td>ATK +20</td></tr>
      </table>
      <div class="mw-collapsible skill">
        <b class="name">Tactical Chant</b>
        <button><span>Show effects</span></button>
        <div><table class="levels">
          <tr><th>Lv</th></tr>
          <tr><td>ASPD +10</td><td>10</td><td>40</td><td>20</td></tr>
          <tr><td>short</td></tr>
          <tr><td>ASPD +12</td><td>10</td><td>39</td><td>20</td></tr>
        </table></div>
      </div>
      <div class="mw-collapsible skill"><p>No name here</p></div>
      <table class="promotion"><tr><td>
        <button class="toggle"><span>Elite 1</span></button>
        <div class="mw-collapsible-content">LMD 20K Chip 5
          <img alt="LMD.png"><img alt="Medic Chip.png"><img alt="Class icon.png">
        </div>
      </td></tr></table>
    </div></div></body></html>"#;

    async fn loaded(site: &FixtureSite) -> Session {
        let mut s = SessionManager::new(Arc::new(site.launcher()))
            .create()
            .await
            .unwrap();
        s.backend_mut()
            .open("wiki/Aak", Duration::from_secs(1))
            .await
            .unwrap();
        s
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::optional(2, Duration::ZERO)
    }

    fn css(s: &str) -> Selector {
        Selector::css(s)
    }

    async fn run(spec: ExtractorSpec) -> Option<FieldValue> {
        let site = FixtureSite::new().with_page("wiki/Aak", OPERATOR);
        let session = loaded(&site).await;
        let doc = session.document(policy());
        evaluate(&spec, *doc.locator(), None).await.unwrap()
    }

    fn kv() -> ExtractorSpec {
        ExtractorSpec::KeyValue {
            row: css("div.pi-data"),
            label: css("h3"),
            value: css("div.pi-data-value"),
            list_item: Some(css("li")),
            exclude: Vec::new(),
        }
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("Ref. No./Code"), "ref_no_code");
        assert_eq!(normalize_label(" Voice actors "), "voice_actors");
    }

    #[test]
    fn test_row_labels() {
        let labels = RowLabels::default();
        let all: Vec<_> = (0..10).map(|i| labels.label(i)).collect();
        assert_eq!(all, vec!["1", "2", "3", "4", "5", "6", "7", "M1", "M2", "M3"]);
    }

    #[test]
    fn test_unit_config_shape() {
        let json = r#"{
            "name": "stats",
            "kind": "table",
            "table": {"css": "table.stats"},
            "row": {"css": "tr"},
            "header": {"css": "th"},
            "cell": {"css": "td"},
            "columns": ["Base", "Max"],
            "skip_rows": 1
        }"#;
        let unit: ConfiguredUnit = serde_json::from_str(json).unwrap();
        assert_eq!(unit.field_name(), "stats");
        assert!(matches!(unit.spec, ExtractorSpec::Table { skip_rows: 1, .. }));
    }

    #[tokio::test]
    async fn test_key_value_with_lists() {
        let value = run(ExtractorSpec::Group {
            container: Some(css("aside")),
            expand: None,
            fields: vec![FieldSpec::new("info", kv())],
        })
        .await
        .unwrap();
        let info = value.as_map().unwrap().get("info").unwrap().as_map().unwrap();

        assert_eq!(info.get("class"), Some(&FieldValue::text("Specialist")));
        assert_eq!(info.get("ref_no_code"), Some(&FieldValue::text("AK01")));
        assert_eq!(
            info.get("tags"),
            Some(&FieldValue::List(vec!["Support".into(), "DPS".into()]))
        );
    }

    #[tokio::test]
    async fn test_keyed_sections_skip_excluded() {
        let value = run(ExtractorSpec::Keyed {
            item: css("section.pi-group"),
            key: css("h2"),
            exclude: vec!["related characters".into()],
            value: Box::new(kv()),
        })
        .await
        .unwrap();
        let sections = value.as_map().unwrap();
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["voice_actors"]);
    }

    #[tokio::test]
    async fn test_table_fills_missing_cells() {
        let value = run(ExtractorSpec::Table {
            table: Some(css("table.stats")),
            row: css("tr"),
            header: css("th"),
            cell: css("td"),
            columns: vec!["Base".into(), "Max".into()],
            skip_rows: 1,
        })
        .await
        .unwrap();
        let stats = value.as_map().unwrap();
        let atk = stats.get("ATK").unwrap().as_map().unwrap();
        assert_eq!(atk.get("Base"), Some(&FieldValue::text("200")));
        assert_eq!(atk.get("Max"), Some(&FieldValue::text("")));
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["HP", "ATK"]);
    }

    #[tokio::test]
    async fn test_numbered_with_seed_and_skips() {
        let value = run(ExtractorSpec::Numbered {
            table: Some(css("table.potential")),
            row: css("tr"),
            cell: css("td:nth-child(2)"),
            prefix: "Pot".into(),
            skip_rows: 1,
            skip_if_contains: vec!["OR".into()],
            keep_if_contains: vec!["Potential".into()],
            seed: Some("Base form".into()),
        })
        .await
        .unwrap();
        let pots = value.as_map().unwrap();
        assert_eq!(pots.get("Pot 1"), Some(&FieldValue::text("Base form")));
        assert_eq!(pots.get("Pot 2"), Some(&FieldValue::text("Deployment Cost -1")));
        assert_eq!(pots.get("Pot 3"), Some(&FieldValue::text("ATK +20")));
        assert_eq!(pots.len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_with_expand_and_rows() {
        let site = FixtureSite::new().with_page("wiki/Aak", OPERATOR);
        let session = loaded(&site).await;
        let doc = session.document(policy());

        let spec = ExtractorSpec::Repeated {
            item: css("div.skill"),
            expand: Some(Expand {
                toggle: css("button span"),
                when_text_contains: Some("Show effects".into()),
            }),
            fields: vec![
                FieldSpec::new(
                    "name",
                    ExtractorSpec::Text {
                        selector: Some(css("b.name")),
                        required: false,
                    },
                ),
                FieldSpec::new(
                    "levels",
                    ExtractorSpec::Rows {
                        table: Some(css("table.levels")),
                        row: css("tr"),
                        cell: css("td"),
                        columns: vec![
                            "effect".into(),
                            "initial_sp".into(),
                            "sp_cost".into(),
                            "duration".into(),
                        ],
                        skip_rows: 1,
                        min_cells: 4,
                        row_labels: Some(RowLabels::default()),
                    },
                ),
            ],
            require_field: Some("name".into()),
        };
        let value = evaluate(&spec, *doc.locator(), None).await.unwrap().unwrap();
        let skills = value.as_list().unwrap();
        assert_eq!(skills.len(), 1);

        let skill = skills[0].as_map().unwrap();
        assert_eq!(skill.get("name"), Some(&FieldValue::text("Tactical Chant")));
        let levels = skill.get("levels").unwrap().as_list().unwrap();
        assert_eq!(levels.len(), 2);
        let third = levels[1].as_map().unwrap();
        assert_eq!(third.get("level"), Some(&FieldValue::text("3")));
        assert_eq!(third.get("sp_cost"), Some(&FieldValue::text("39")));
        assert_eq!(site.action_count(), 1);
    }

    #[tokio::test]
    async fn test_group_with_materials() {
        let value = run(ExtractorSpec::Group {
            container: Some(css("table.promotion div.mw-collapsible-content")),
            expand: Some(Expand {
                toggle: css("table.promotion button.toggle"),
                when_text_contains: None,
            }),
            fields: vec![
                FieldSpec::new(
                    "details",
                    ExtractorSpec::Text {
                        selector: None,
                        required: false,
                    },
                ),
                FieldSpec::new(
                    "materials",
                    ExtractorSpec::Materials {
                        container: None,
                        image: default_image_selector(),
                        ignore_images_containing: default_ignored_images(),
                    },
                ),
            ],
        })
        .await
        .unwrap();
        let elite = value.as_map().unwrap();
        assert_eq!(elite.get("details"), Some(&FieldValue::text("LMD 20K Chip 5")));
        let materials = elite.get("materials").unwrap().as_list().unwrap();
        assert_eq!(materials.len(), 2);
        let chip = materials[1].as_map().unwrap();
        assert_eq!(chip.get("name"), Some(&FieldValue::text("Medic Chip")));
        assert_eq!(chip.get("quantity"), Some(&FieldValue::text("5")));
    }

    #[tokio::test]
    async fn test_required_text_propagates_failure() {
        let site = FixtureSite::new().with_page("wiki/Aak", OPERATOR);
        let session = loaded(&site).await;
        let doc = session.document(policy());

        let unit = ConfiguredUnit::new(
            "title",
            ExtractorSpec::Text {
                selector: Some(css("h1.missing")),
                required: true,
            },
        );
        assert!(matches!(
            unit.extract(&doc).await,
            Err(ExtractionError::Locator(_))
        ));

        let unit = ConfiguredUnit::new(
            "class",
            ExtractorSpec::Attribute {
                selector: css("img"),
                attribute: "alt".into(),
                strip_extension: true,
                required: false,
            },
        )
        .with_field("first_image");
        let record = unit.extract(&doc).await.unwrap();
        assert_eq!(record.get("first_image"), Some(&FieldValue::text("LMD")));
    }
}
