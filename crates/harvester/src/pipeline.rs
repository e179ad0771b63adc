//! Extraction pipeline: ordered, isolated extractor units over one document.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::{ConfigError, ExtractionError};
use crate::session::Document;
use crate::value::PartialRecord;

/// One independent extractor over a ready document.
///
/// Units may expand or scroll parts of their own subtree through the
/// document's locator, but must not assume earlier units left anything behind.
#[async_trait]
pub trait ExtractorUnit: Send + Sync {
    /// Unique within a pipeline.
    fn name(&self) -> &str;

    async fn extract(&self, doc: &Document<'_>) -> Result<PartialRecord, ExtractionError>;
}

/// Result of one unit on one document.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: String,
    pub result: Result<PartialRecord, ExtractionError>,
    pub elapsed_ms: u64,
}

impl UnitOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Units run in declared order; declared order is merge precedence.
#[derive(Clone)]
pub struct Pipeline {
    units: Vec<Arc<dyn ExtractorUnit>>,
}

impl Pipeline {
    pub fn new(units: Vec<Arc<dyn ExtractorUnit>>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.name().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate extractor unit name: {}",
                    unit.name()
                )));
            }
        }
        Ok(Self { units })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.name())
    }

    /// Run every unit in order. A failing or panicking unit is recorded and
    /// the rest still run.
    pub async fn run(&self, doc: &Document<'_>) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            let start = Instant::now();
            let result = match AssertUnwindSafe(unit.extract(doc)).catch_unwind().await {
                Ok(Ok(record)) if record.is_empty() => Err(ExtractionError::Empty),
                Ok(result) => result,
                Err(panic) => Err(ExtractionError::Panicked(panic_message(&*panic))),
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(record) => tracing::debug!(
                    "Unit {} produced {} field(s) from {} in {elapsed_ms}ms",
                    unit.name(),
                    record.len(),
                    doc.address()
                ),
                Err(e) => tracing::warn!("Unit {} failed on {}: {e}", unit.name(), doc.address()),
            }

            outcomes.push(UnitOutcome {
                unit: unit.name().to_string(),
                result,
                elapsed_ms,
            });
        }

        outcomes
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::fixture::FixtureSite;
    use crate::document::Selector;
    use crate::locator::RetryPolicy;
    use crate::session::SessionManager;
    use crate::value::FieldValue;

    struct Fixed(&'static str, Option<&'static str>);

    #[async_trait]
    impl ExtractorUnit for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn extract(&self, _doc: &Document<'_>) -> Result<PartialRecord, ExtractionError> {
            match self.1 {
                Some(v) => Ok(PartialRecord::new().with(self.0, v)),
                None => Ok(PartialRecord::new()),
            }
        }
    }

    struct Title;

    #[async_trait]
    impl ExtractorUnit for Title {
        fn name(&self) -> &str {
            "title"
        }

        async fn extract(&self, doc: &Document<'_>) -> Result<PartialRecord, ExtractionError> {
            let el = doc.locator().require(&Selector::css("h1"), None).await?;
            Ok(PartialRecord::new().with("title", el.text))
        }
    }

    struct Explodes;

    #[async_trait]
    impl ExtractorUnit for Explodes {
        fn name(&self) -> &str {
            "explodes"
        }

        async fn extract(&self, _doc: &Document<'_>) -> Result<PartialRecord, ExtractionError> {
            panic!("boom")
        }
    }

    async fn loaded(site: &FixtureSite) -> crate::session::Session {
        let mut s = SessionManager::new(Arc::new(site.launcher()))
            .create()
            .await
            .unwrap();
        s.backend_mut()
            .open("doc", Duration::from_secs(1))
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn test_failing_unit_does_not_block_others() {
        let site = FixtureSite::new().with_page("doc", "<p>no heading</p>");
        let session = loaded(&site).await;
        let doc = session.document(RetryPolicy::optional(2, Duration::ZERO));

        let pipeline = Pipeline::new(vec![
            Arc::new(Fixed("first", Some("1"))),
            Arc::new(Title),
            Arc::new(Fixed("third", Some("3"))),
        ])
        .unwrap();
        let outcomes = pipeline.run(&doc).await;

        let names: Vec<_> = outcomes.iter().map(|o| o.unit.as_str()).collect();
        assert_eq!(names, vec!["first", "title", "third"]);
        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(ExtractionError::Locator(_))
        ));
        let third = outcomes[2].result.as_ref().unwrap();
        assert_eq!(third.get("third"), Some(&FieldValue::text("3")));
    }

    #[tokio::test]
    async fn test_panic_and_empty_are_failures() {
        let site = FixtureSite::new().with_page("doc", "<h1>Aak</h1>");
        let session = loaded(&site).await;
        let doc = session.document(RetryPolicy::optional(1, Duration::ZERO));

        let pipeline = Pipeline::new(vec![
            Arc::new(Explodes),
            Arc::new(Fixed("empty", None)),
            Arc::new(Title),
        ])
        .unwrap();
        let outcomes = pipeline.run(&doc).await;

        assert!(matches!(&outcomes[0].result, Err(ExtractionError::Panicked(m)) if m == "boom"));
        assert!(matches!(outcomes[1].result, Err(ExtractionError::Empty)));
        let title = outcomes[2].result.as_ref().unwrap();
        assert_eq!(title.get("title"), Some(&FieldValue::text("Aak")));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Pipeline::new(vec![
            Arc::new(Fixed("a", Some("1"))),
            Arc::new(Fixed("a", Some("2"))),
        ]);
        assert!(err.is_err());
    }
}
