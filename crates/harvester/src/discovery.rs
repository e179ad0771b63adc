//! Entity discovery: read the id list for a batch off an index document.

use std::collections::HashSet;

use crate::document::{normalize_whitespace, Selector};
use crate::error::DiscoveryError;
use crate::locator::RetryPolicy;
use crate::navigation::{Navigator, DEFAULT_NAV_ATTEMPTS};
use crate::session::Session;
use crate::value::EntityId;

/// Load the index at `address`, wait for `marker`, and take one id per
/// `item` match from its text.
///
/// Blank entries are skipped and repeats keep their first position. With an
/// optional `policy` a page without items yields an empty list.
pub async fn discover_ids(
    session: &mut Session,
    navigator: &Navigator,
    address: &str,
    marker: &Selector,
    item: &Selector,
    policy: RetryPolicy,
) -> Result<Vec<EntityId>, DiscoveryError> {
    let ready = navigator
        .load(session, address, marker, DEFAULT_NAV_ATTEMPTS)
        .await?;

    let doc = session.document(policy);
    let items = doc.locator().locate_all(item, None, policy).await?;

    let mut seen = HashSet::new();
    let ids: Vec<EntityId> = items
        .iter()
        .map(|el| normalize_whitespace(&el.text))
        .filter(|text| !text.is_empty() && seen.insert(text.clone()))
        .map(EntityId::from)
        .collect();

    tracing::info!(
        "Discovered {} entities from {} item(s) at {}",
        ids.len(),
        items.len(),
        ready.address
    );
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fixture::FixtureSite;
    use crate::session::SessionManager;
    use std::sync::Arc;
    use std::time::Duration;

    const INDEX: &str = r#"<html><body><div id="content">
        <table class="ops">
          <tr><th>Name</th></tr>
          <tr><td><a href="/wiki/Aak">Aak</a></td></tr>
          <tr><td><a href="/wiki/W">  W/Ch'en </a></td></tr>
          <tr><td><a href="/wiki/Exusiai">Exusiai</a></td></tr>
          <tr><td><a href="/wiki/Aak">Aak</a></td></tr>
          <tr><td><a href="/wiki/none"> </a></td></tr>
        </table>
    </div></body></html>"#;

    fn navigator() -> Navigator {
        Navigator::new(
            Duration::from_secs(1),
            RetryPolicy::required(2, Duration::ZERO),
            Duration::ZERO,
        )
    }

    async fn session(site: &FixtureSite) -> Session {
        SessionManager::new(Arc::new(site.launcher()))
            .with_retry(1, Duration::ZERO)
            .create()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_collects_link_texts_in_order() {
        let site = FixtureSite::new().with_page("wiki/Operator_List", INDEX);
        let mut session = session(&site).await;

        let ids = discover_ids(
            &mut session,
            &navigator(),
            "wiki/Operator_List",
            &Selector::css("table.ops"),
            &Selector::css("table.ops td a"),
            RetryPolicy::optional(1, Duration::ZERO),
        )
        .await
        .unwrap();

        let names: Vec<&str> = ids.iter().map(EntityId::as_str).collect();
        assert_eq!(names, vec!["Aak", "W/Ch'en", "Exusiai"]);
        assert_eq!(session.address(), Some("wiki/Operator_List"));
    }

    #[tokio::test]
    async fn test_index_without_items() {
        let site = FixtureSite::new().with_page("wiki/Empty", r#"<table class="ops"></table>"#);
        let mut session = session(&site).await;
        let item = Selector::css("table.ops td a");

        let ids = discover_ids(
            &mut session,
            &navigator(),
            "wiki/Empty",
            &Selector::css("table.ops"),
            &item,
            RetryPolicy::optional(2, Duration::ZERO),
        )
        .await
        .unwrap();
        assert!(ids.is_empty());

        let err = discover_ids(
            &mut session,
            &navigator(),
            "wiki/Empty",
            &Selector::css("table.ops"),
            &item,
            RetryPolicy::required(2, Duration::ZERO),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::Locator(_)));
    }

    #[tokio::test]
    async fn test_unready_index_is_navigation_error() {
        let site = FixtureSite::new().with_page("wiki/Operator_List", "<p>maintenance</p>");
        let mut session = session(&site).await;

        let err = discover_ids(
            &mut session,
            &navigator(),
            "wiki/Operator_List",
            &Selector::css("table.ops"),
            &Selector::css("table.ops td a"),
            RetryPolicy::optional(1, Duration::ZERO),
        )
        .await
        .unwrap_err();
        match err {
            DiscoveryError::Navigation(e) => assert_eq!(e.attempts, DEFAULT_NAV_ATTEMPTS),
            other => panic!("expected a navigation error, got {other:?}"),
        }
    }
}
