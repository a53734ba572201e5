//! Commander search discovery: paginated search pages in, deduplicated deck ids out.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use deckharvest_core::DeckIdentifier;
use rand::Rng;
use regex::Regex;
use scraper::Html;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{select_all_attrs, AdapterError};

pub const ORDER_BY_VIEWS: &str = "-viewCount";

/// Anything that can return the raw markup of one commander search page.
#[async_trait]
pub trait SearchPageSource: Send + Sync {
    async fn search_page(
        &self,
        commander_name: &str,
        order_by: &str,
        page: u32,
    ) -> Result<String, AdapterError>;
}

/// Outcome of discovery for one commander in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommanderDiscovery {
    pub commander: String,
    pub deck_ids: BTreeSet<DeckIdentifier>,
    pub error: Option<String>,
}

fn deck_href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"href=["']/decks/(\d+)/[^"']*["']"#).expect("deck href pattern is valid")
    })
}

/// `/decks/<digits>/...` → `<digits>`.
fn deck_id_from_href(href: &str) -> Option<&str> {
    let rest = href.strip_prefix("/decks/")?;
    let (id, _tail) = rest.split_once('/')?;
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id)
    } else {
        None
    }
}

pub fn extract_deck_ids_structured(html: &str) -> Result<BTreeSet<DeckIdentifier>, AdapterError> {
    let document = Html::parse_document(html);
    Ok(select_all_attrs(&document, "a[href]", "href")?
        .iter()
        .filter_map(|href| deck_id_from_href(href))
        .map(str::to_string)
        .collect())
}

pub fn extract_deck_ids_with_pattern(html: &str) -> BTreeSet<DeckIdentifier> {
    deck_href_regex()
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Structured link extraction, with a pattern scan over the raw markup when it finds nothing.
pub fn extract_deck_ids(html: &str) -> BTreeSet<DeckIdentifier> {
    match extract_deck_ids_structured(html) {
        Ok(ids) if !ids.is_empty() => ids,
        Ok(_) => extract_deck_ids_with_pattern(html),
        Err(err) => {
            warn!(error = %err, "structured deck link extraction failed, using pattern scan");
            extract_deck_ids_with_pattern(html)
        }
    }
}

pub async fn discover_deck_ids_by_commander(
    source: &dyn SearchPageSource,
    commander_name: &str,
    order_by: &str,
    page: u32,
) -> Result<BTreeSet<DeckIdentifier>, AdapterError> {
    let html = source.search_page(commander_name, order_by, page).await?;
    let ids = extract_deck_ids(&html);
    debug!(commander = commander_name, page, found = ids.len(), "search page parsed");
    Ok(ids)
}

/// Random pause in `[politeness / 2, politeness]`.
pub fn politeness_delay(politeness: Duration) -> Duration {
    if politeness.is_zero() {
        return Duration::ZERO;
    }
    let secs = politeness.as_secs_f64();
    Duration::from_secs_f64(rand::rng().random_range(secs / 2.0..=secs))
}

/// Walk view-ordered search pages until an empty page or `max_pages`.
///
/// A failing page ends the walk; ids gathered before it are kept. A failure on the very
/// first page is returned as an error.
pub async fn discover_top_viewed_deck_ids_by_commander(
    source: &dyn SearchPageSource,
    commander_name: &str,
    max_pages: u32,
    politeness: Duration,
) -> Result<BTreeSet<DeckIdentifier>, AdapterError> {
    let mut all_ids = BTreeSet::new();

    for page in 1..=max_pages {
        let page_ids =
            match discover_deck_ids_by_commander(source, commander_name, ORDER_BY_VIEWS, page)
                .await
            {
                Ok(ids) => ids,
                Err(err) if page == 1 => return Err(err),
                Err(err) => {
                    warn!(
                        commander = commander_name,
                        page,
                        error = %err,
                        "search page failed, stopping"
                    );
                    break;
                }
            };

        if page_ids.is_empty() {
            debug!(commander = commander_name, page, "empty search page, end of results");
            break;
        }
        all_ids.extend(page_ids);

        if page < max_pages {
            tokio::time::sleep(politeness_delay(politeness)).await;
        }
    }

    info!(
        commander = commander_name,
        unique = all_ids.len(),
        "commander discovery finished"
    );
    Ok(all_ids)
}

/// Sequential discovery over many commanders; one commander failing leaves an empty entry.
pub async fn discover_deck_ids_for_commanders(
    source: &dyn SearchPageSource,
    commanders: &[String],
    max_pages: u32,
    politeness: Duration,
) -> Vec<CommanderDiscovery> {
    let mut out = Vec::with_capacity(commanders.len());
    for commander in commanders {
        let entry = match discover_top_viewed_deck_ids_by_commander(
            source, commander, max_pages, politeness,
        )
        .await
        {
            Ok(deck_ids) => CommanderDiscovery {
                commander: commander.clone(),
                deck_ids,
                error: None,
            },
            Err(err) => {
                warn!(commander = %commander, error = %err, "commander discovery failed");
                CommanderDiscovery {
                    commander: commander.clone(),
                    deck_ids: BTreeSet::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        out.push(entry);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn page_html(ids: &[&str]) -> String {
        let links = ids
            .iter()
            .map(|id| format!(r#"<a class="deck" href="/decks/{id}/some-deck">Deck {id}</a>"#))
            .collect::<String>();
        format!(
            "<html><body>{links}<a href=\"/decks/abc/x\">bad</a>\
             <a href=\"/search\">s</a></body></html>"
        )
    }

    /// Canned pages keyed by (commander, page); anything else is an empty page.
    #[derive(Default)]
    struct FakeSearch {
        pages: HashMap<(String, u32), Result<String, String>>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl FakeSearch {
        fn page(mut self, commander: &str, page: u32, ids: &[&str]) -> Self {
            self.pages
                .insert((commander.to_string(), page), Ok(page_html(ids)));
            self
        }

        fn failing(mut self, commander: &str, page: u32) -> Self {
            self.pages
                .insert((commander.to_string(), page), Err("boom".into()));
            self
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SearchPageSource for FakeSearch {
        async fn search_page(
            &self,
            commander_name: &str,
            order_by: &str,
            page: u32,
        ) -> Result<String, AdapterError> {
            assert_eq!(order_by, ORDER_BY_VIEWS);
            self.calls
                .lock()
                .unwrap()
                .push((commander_name.to_string(), page));
            match self.pages.get(&(commander_name.to_string(), page)) {
                Some(Ok(html)) => Ok(html.clone()),
                Some(Err(msg)) => Err(AdapterError::Message(msg.clone())),
                None => Ok("<html><body>No decks</body></html>".into()),
            }
        }
    }

    #[test]
    fn structured_extraction_reads_numeric_deck_links() {
        let ids = extract_deck_ids(&page_html(&["10", "11", "10"]));
        assert_eq!(ids, BTreeSet::from(["10".to_string(), "11".to_string()]));
    }

    #[test]
    fn pattern_scan_handles_markup_without_anchor_elements() {
        let raw = r#"{"html":"<div data-x href='/decks/77/foo'></div>"} href="/decks/78/""#;
        let ids = extract_deck_ids(raw);
        assert_eq!(ids, BTreeSet::from(["77".to_string(), "78".to_string()]));
    }

    #[test]
    fn search_fixture_yields_its_deck_ids() {
        let html = crate::test_support::read_fixture("archidekt/search_page.html");
        let ids = extract_deck_ids(&html);
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("1234567"));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_pages_dedupe_to_distinct_ids() {
        let search = FakeSearch::default()
            .page("Atraxa", 1, &["1", "2", "3", "3"])
            .page("Atraxa", 2, &["3", "4"])
            .page("Atraxa", 3, &["1", "5"]);

        let ids = discover_top_viewed_deck_ids_by_commander(&search, "Atraxa", 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_stops_pagination_early() {
        let search = FakeSearch::default()
            .page("Atraxa", 1, &["1"])
            .page("Atraxa", 3, &["9"]);

        let ids = discover_top_viewed_deck_ids_by_commander(&search, "Atraxa", 5, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(ids, BTreeSet::from(["1".to_string()]));
        assert_eq!(search.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn politeness_delay_runs_between_pages_only() {
        let search = FakeSearch::default()
            .page("Atraxa", 1, &["1"])
            .page("Atraxa", 2, &["2"]);
        let start = Instant::now();

        discover_top_viewed_deck_ids_by_commander(&search, "Atraxa", 2, Duration::from_secs(4))
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(4), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn later_page_failure_keeps_collected_ids() {
        let search = FakeSearch::default()
            .page("Atraxa", 1, &["1", "2"])
            .failing("Atraxa", 2);

        let ids = discover_top_viewed_deck_ids_by_commander(&search, "Atraxa", 4, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_isolates_a_failing_commander() {
        let search = FakeSearch::default()
            .page("Atraxa", 1, &["1"])
            .failing("Broken", 1)
            .page("Edgar", 1, &["2", "3"]);
        let commanders = vec!["Atraxa".to_string(), "Broken".to_string(), "Edgar".to_string()];

        let results =
            discover_deck_ids_for_commanders(&search, &commanders, 1, Duration::ZERO).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].deck_ids.len(), 1);
        assert!(results[1].deck_ids.is_empty());
        assert!(results[1].error.is_some());
        assert_eq!(results[2].deck_ids.len(), 2);
    }
}
