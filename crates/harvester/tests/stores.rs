//! Record store integration tests through the public API and config builders.

use std::sync::Arc;

use harvester::config::{HarvestConfig, StoreKind};
use harvester::{EntityId, FieldMap, FieldValue, PartialRecord, RecordStore, StoreError};

fn stores(dir: &std::path::Path) -> Vec<(StoreKind, Arc<dyn RecordStore>)> {
    [StoreKind::Memory, StoreKind::JsonDir, StoreKind::Sqlite]
        .into_iter()
        .map(|kind| {
            let mut config = HarvestConfig::default();
            config.store.kind = kind;
            config.store.path = Some(match kind {
                StoreKind::Sqlite => dir.join("records.db"),
                _ => dir.join("records"),
            });
            (kind, config.store().unwrap())
        })
        .collect()
}

fn stats(base: &str) -> FieldValue {
    let mut hp = FieldMap::new();
    hp.insert("Base", FieldValue::text(base));
    let mut stats = FieldMap::new();
    stats.insert("HP", FieldValue::Map(hp));
    FieldValue::Map(stats)
}

#[test]
fn test_merge_laws_hold_for_every_store() {
    let tmp = tempfile::TempDir::new().unwrap();
    let aak = EntityId::from("Aak");

    for (kind, store) in stores(tmp.path()) {
        store
            .merge(&aak, PartialRecord::new().with("stats", stats("700")))
            .unwrap();
        store
            .merge(
                &aak,
                PartialRecord::new().with(
                    "skills",
                    FieldValue::List(vec![FieldValue::text("Tactical Chant")]),
                ),
            )
            .unwrap();
        let merged = store
            .merge(&aak, PartialRecord::new().with("stats", stats("750")))
            .unwrap();

        assert_eq!(merged.fields.len(), 2, "{kind:?}");
        assert_eq!(merged.get("stats"), Some(&stats("750")), "{kind:?}");
        assert_eq!(store.get(&aak).unwrap(), Some(merged), "{kind:?}");

        assert!(matches!(
            store.merge(&"Exusiai".into(), PartialRecord::new()),
            Err(StoreError::EmptyPartial(_))
        ));
        assert!(
            matches!(
                store.merge(&"".into(), PartialRecord::new().with("class", "Guard")),
                Err(StoreError::EmptyEntity)
            ),
            "{kind:?}"
        );
        assert_eq!(store.ids().unwrap(), vec![aak.clone()], "{kind:?}");
        assert_eq!(store.clear(Some(&aak)).unwrap(), 1, "{kind:?}");
        assert!(store.get(&aak).unwrap().is_none(), "{kind:?}");
    }
}

#[test]
fn test_persistent_stores_survive_rebuild() {
    let tmp = tempfile::TempDir::new().unwrap();
    let id = EntityId::from("W/Ch'en");

    for (_, store) in stores(tmp.path()) {
        store
            .merge(&id, PartialRecord::new().with("class", "Guard"))
            .unwrap();
    }

    for (kind, store) in stores(tmp.path()) {
        let found = store.get(&id).unwrap();
        match kind {
            StoreKind::Memory => assert!(found.is_none()),
            _ => assert_eq!(
                found.unwrap().get("class"),
                Some(&FieldValue::text("Guard")),
                "{kind:?}"
            ),
        }
    }
}
