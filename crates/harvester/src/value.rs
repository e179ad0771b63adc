//! Record data model: entity keys, tagged field values, partial and persisted records.

use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Opaque key identifying one document/subject, e.g. an operator name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A scalar string, an ordered list, or an ordered name→value mapping.
///
/// JSON form is untagged. Reading JSON back turns numbers and booleans into
/// their text and `null` into the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<FieldValue>),
    Map(FieldMap),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            FieldValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// True for the empty string, an empty list, or an empty mapping.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Map(map) => map.is_empty(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(items: Vec<FieldValue>) -> Self {
        FieldValue::List(items)
    }
}

impl From<FieldMap> for FieldValue {
    fn from(map: FieldMap) -> Self {
        FieldValue::Map(map)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            FieldValue::Map(map) => map.serialize(serializer),
        }
    }
}

struct FieldValueVisitor;

impl<'de> Visitor<'de> for FieldValueVisitor {
    type Value = FieldValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, array or object")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(v.to_string()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(String::new()))
    }

    fn visit_none<E: de::Error>(self) -> Result<FieldValue, E> {
        Ok(FieldValue::Text(String::new()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<FieldValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(FieldValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, access: A) -> Result<FieldValue, A::Error> {
        FieldMapVisitor.visit_map(access).map(FieldValue::Map)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FieldValueVisitor)
    }
}

/// Insertion-ordered mapping with unique keys.
///
/// Inserting an existing key replaces the value in place, keeping its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, FieldValue)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for FieldMap {
    type Item = (String, FieldValue);
    type IntoIter = std::vec::IntoIter<(String, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct FieldMapVisitor;

impl<'de> Visitor<'de> for FieldMapVisitor {
    type Value = FieldMap;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMap, A::Error> {
        let mut map = FieldMap::new();
        while let Some((k, v)) = access.next_entry::<String, FieldValue>()? {
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FieldMapVisitor)
    }
}

/// Fields produced by one extractor unit for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialRecord {
    fields: FieldMap,
}

impl PartialRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field, value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_fields(self) -> FieldMap {
        self.fields
    }
}

impl From<FieldMap> for PartialRecord {
    fn from(fields: FieldMap) -> Self {
        Self { fields }
    }
}

/// The accumulated record for one entity across every merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub entity: EntityId,
    pub fields: FieldMap,
}

impl PersistedRecord {
    pub fn empty(entity: EntityId) -> Self {
        Self {
            entity,
            fields: FieldMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Shallow overlay: each top-level field of `partial` replaces any
    /// existing field of the same name. Returns the names that collided.
    pub fn overlay(&mut self, partial: PartialRecord) -> Vec<String> {
        let mut collisions = Vec::new();
        for (key, value) in partial.into_fields() {
            if self.fields.insert(key.clone(), value).is_some() {
                collisions.push(key);
            }
        }
        collisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_map_replace_keeps_position() {
        let mut map = FieldMap::new();
        map.insert("Base", "1");
        map.insert("Max", "2");
        let old = map.insert("Base", "9");
        assert_eq!(old, Some(FieldValue::text("1")));
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec!["Base", "Max"]);
        assert_eq!(map.get("Base"), Some(&FieldValue::text("9")));
    }

    #[test]
    fn test_json_preserves_insertion_order() {
        let map: FieldMap = [("zeta", "z"), ("alpha", "a"), ("mid", "m")]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&FieldValue::Map(map)).unwrap();
        assert_eq!(json, r#"{"zeta":"z","alpha":"a","mid":"m"}"#);
    }

    #[test]
    fn test_json_scalars_become_text() {
        let v: FieldValue = serde_json::from_str(r#"{"hp": 2000, "ok": true, "none": null, "xs": [1, "b"]}"#).unwrap();
        let map = v.as_map().unwrap();
        assert_eq!(map.get("hp"), Some(&FieldValue::text("2000")));
        assert_eq!(map.get("ok"), Some(&FieldValue::text("true")));
        assert_eq!(map.get("none"), Some(&FieldValue::text("")));
        let xs = map.get("xs").unwrap().as_list().unwrap();
        assert_eq!(xs, &[FieldValue::text("1"), FieldValue::text("b")]);
    }

    #[test]
    fn test_overlay_reports_collisions() {
        let mut record = PersistedRecord::empty(EntityId::from("Aak"));
        let first = record.overlay(PartialRecord::new().with("stats", "a").with("skills", "b"));
        assert!(first.is_empty());
        let second = record.overlay(PartialRecord::new().with("skills", "c").with("talents", "d"));
        assert_eq!(second, vec!["skills".to_string()]);
        assert_eq!(record.get("skills"), Some(&FieldValue::text("c")));
        assert_eq!(record.fields.len(), 3);
    }

    #[test]
    fn test_entity_id_serializes_transparently() {
        let id = EntityId::from("Ch'en");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"Ch'en\"");
        assert_eq!(id.to_string(), "Ch'en");
    }
}
