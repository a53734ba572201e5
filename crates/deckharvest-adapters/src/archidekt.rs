use std::sync::Arc;

use async_trait::async_trait;
use deckharvest_core::{CardEntry, DeckIdentifier, NormalizedDeck, Zone};
use deckharvest_storage::RequestEngine;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::discovery::{self, SearchPageSource};
use crate::{
    copy_extra, json_quantity, json_str, json_u64, sanity_check, AdapterError, BulkFetchable,
    BulkPage, Discoverable, DiscoveryOptions, SourceAdapter,
};

pub const SOURCE_NAME: &str = "archidekt";
pub const COMMANDER_FORMAT_ID: u32 = 3;

/// Bulk-capable adapter over Archidekt's public JSON API and commander search pages.
#[derive(Debug, Clone)]
pub struct ArchidektAdapter {
    engine: Arc<RequestEngine>,
    base_url: String,
    format_filter: u32,
}

impl ArchidektAdapter {
    pub fn new(
        engine: Arc<RequestEngine>,
        base_url: impl Into<String>,
        format_filter: u32,
    ) -> Self {
        Self {
            engine,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            format_filter,
        }
    }

    pub fn engine(&self) -> &Arc<RequestEngine> {
        &self.engine
    }

    async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, AdapterError> {
        let resp = self.engine.get(url, params, None).await?;
        resp.json::<JsonValue>()
            .map_err(|e| AdapterError::malformed(SOURCE_NAME, format!("{url}: {e}")))
    }

    /// Raw detail payload of one deck, or the error Archidekt reported for it.
    pub async fn fetch_payload(&self, id: &str) -> Result<DeckPayload, AdapterError> {
        let url = format!("{}/api/decks/{id}/", self.base_url);
        let raw = self.get_json(&url, &[]).await?;
        match raw.get("error") {
            Some(err) => Ok(DeckPayload::Rejected(
                err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string()),
            )),
            None => Ok(DeckPayload::Found(raw)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeckPayload {
    Found(JsonValue),
    /// The API answered with an `error` body, e.g. for private or deleted decks.
    Rejected(String),
}

fn id_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn is_commander_entry(entry: &JsonValue) -> bool {
    entry
        .get("categories")
        .and_then(|c| c.as_array())
        .is_some_and(|cats| {
            cats.iter()
                .filter_map(|c| c.as_str())
                .any(|c| c == "Commander" || c == "commander")
        })
}

/// Translate one Archidekt deck payload into a `NormalizedDeck`.
pub fn normalize_deck(raw: &JsonValue) -> Result<NormalizedDeck, AdapterError> {
    let id = raw
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| AdapterError::malformed(SOURCE_NAME, "deck without id"))?;

    let mut cards = Vec::new();
    for entry in raw
        .get("cards")
        .and_then(|c| c.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let name = json_str(entry, &["card", "name"])
            .or_else(|| json_str(entry, &["card", "oracleCard", "name"]))
            .unwrap_or_default()
            .trim();
        if name.is_empty() {
            continue;
        }
        let quantity = json_quantity(SOURCE_NAME, entry)?;
        let zone = if is_commander_entry(entry) {
            Zone::Command
        } else {
            Zone::Main
        };
        let canonical_id = json_str(entry, &["card", "oracleId"])
            .or_else(|| json_str(entry, &["card", "oracleCard", "uid"]))
            .map(str::to_string);
        cards.push(CardEntry::new(name, quantity, zone).with_canonical_id(canonical_id));
    }

    let mut extra = copy_extra(
        raw,
        &[
            ("featured", "featured", json!(false)),
            ("private", "private", json!(true)),
            ("views", "viewCount", json!(0)),
            ("created_at", "createdAt", JsonValue::Null),
            ("updated_at", "updatedAt", JsonValue::Null),
        ],
    );
    extra.insert("archidekt_id".into(), raw["id"].clone());

    let deck = NormalizedDeck {
        url: format!("https://archidekt.com/decks/{id}/"),
        source_deck_id: id,
        title: json_str(raw, &["name"]).unwrap_or_default().to_string(),
        author: json_str(raw, &["owner", "username"])
            .unwrap_or_default()
            .to_string(),
        format: "Commander".into(),
        cards,
        extra,
    };
    sanity_check(SOURCE_NAME, &deck, None);
    Ok(deck)
}

#[async_trait]
impl SourceAdapter for ArchidektAdapter {
    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<NormalizedDeck>, AdapterError> {
        match self.fetch_payload(id).await? {
            DeckPayload::Found(raw) => normalize_deck(&raw).map(Some),
            DeckPayload::Rejected(err) => {
                warn!(deck_id = id, error = %err, "archidekt reported an error for deck");
                Ok(None)
            }
        }
    }

    fn as_discoverable(&self) -> Option<&dyn Discoverable> {
        Some(self)
    }

    fn as_bulk(&self) -> Option<&dyn BulkFetchable> {
        Some(self)
    }
}

#[async_trait]
impl BulkFetchable for ArchidektAdapter {
    async fn fetch_bulk(&self, page: u32, page_size: u32) -> Result<BulkPage, AdapterError> {
        let url = format!("{}/api/decks/", self.base_url);
        let params = [
            ("page", page.to_string()),
            ("pageSize", page_size.to_string()),
            ("formats", self.format_filter.to_string()),
            ("orderBy", "-createdAt".to_string()),
            ("owner__isnull", "false".to_string()),
            ("public", "true".to_string()),
        ];
        let data = self.get_json(&url, &params).await?;
        if let Some(err) = data.get("error") {
            return Err(AdapterError::malformed(
                SOURCE_NAME,
                format!("bulk page {page}: {err}"),
            ));
        }

        let mut listing = BulkPage::default();
        for raw in data
            .get("results")
            .and_then(|r| r.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            match normalize_deck(raw) {
                Ok(deck) => listing.decks.push(deck),
                Err(err) => {
                    warn!(page, error = %err, "skipping malformed archidekt deck");
                    listing.malformed += 1;
                }
            }
        }
        Ok(listing)
    }

    async fn total_pages(&self, page_size: u32) -> Result<u32, AdapterError> {
        let url = format!("{}/api/decks/cards/", self.base_url);
        let params = [
            ("page", "1".to_string()),
            ("pageSize", "1".to_string()),
            ("formats", self.format_filter.to_string()),
            ("public", "true".to_string()),
        ];
        let data = self.get_json(&url, &params).await?;
        let count = json_u64(&data, &["count"]).unwrap_or(0);
        let pages = count.div_ceil(u64::from(page_size.max(1)));
        info!(count, pages, "archidekt listing size");
        Ok(pages.min(u64::from(u32::MAX)) as u32)
    }
}

#[async_trait]
impl SearchPageSource for ArchidektAdapter {
    async fn search_page(
        &self,
        commander_name: &str,
        order_by: &str,
        page: u32,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/search/decks", self.base_url);
        let params = [
            ("commanderName", commander_name.to_string()),
            ("orderBy", order_by.to_string()),
            ("page", page.to_string()),
        ];
        Ok(self.engine.get(&url, &params, None).await?.text())
    }
}

#[async_trait]
impl Discoverable for ArchidektAdapter {
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<Vec<DeckIdentifier>, AdapterError> {
        let results = discovery::discover_deck_ids_for_commanders(
            self,
            &options.commanders,
            options.max_pages,
            options.politeness,
        )
        .await;

        let mut ids = results
            .into_iter()
            .flat_map(|r| r.deck_ids)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if let Some(max) = options.max_ids {
            ids.truncate(max);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::read_fixture;
    use deckharvest_storage::{RateLimiter, RequestEngineConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> ArchidektAdapter {
        let engine = RequestEngine::new(
            SOURCE_NAME,
            Arc::new(RateLimiter::disabled()),
            RequestEngineConfig::default(),
        )
        .unwrap();
        ArchidektAdapter::new(Arc::new(engine), base_url, COMMANDER_FORMAT_ID)
    }

    #[test]
    fn detail_fixture_normalizes_cards_commanders_and_extra() {
        let raw: JsonValue =
            serde_json::from_str(&read_fixture("archidekt/deck_detail.json")).unwrap();
        let deck = normalize_deck(&raw).unwrap();

        assert_eq!(deck.source_deck_id, "1234567");
        assert_eq!(deck.title, "Atraxa Superfriends");
        assert_eq!(deck.author, "planeswalker_pat");
        assert_eq!(deck.url, "https://archidekt.com/decks/1234567/");
        assert_eq!(deck.total_quantity(), 100);

        let commanders = deck.commanders();
        assert_eq!(commanders.len(), 1);
        assert_eq!(commanders[0].name, "Atraxa, Praetors' Voice");
        assert_eq!(
            commanders[0].canonical_id.as_deref(),
            Some("d0c4c2b8-6d9a-4f79-8a2f-6b1c7d0c8d1e")
        );

        let forest = deck.cards.iter().find(|c| c.name == "Forest").unwrap();
        assert_eq!(forest.quantity, 10);
        assert!(forest.canonical_id.is_none());

        assert_eq!(deck.extra["archidekt_id"], json!(1234567));
        assert_eq!(deck.extra["views"], json!(4821));
        assert_eq!(deck.extra["private"], json!(false));
    }

    #[test]
    fn lowercase_commander_category_counts_and_oracle_card_name_is_used() {
        let raw = json!({
            "id": 5,
            "name": "t",
            "cards": [
                {
                    "quantity": 1,
                    "categories": ["commander"],
                    "card": {"oracleCard": {"name": "Edgar Markov"}}
                },
                {"quantity": 0, "categories": null, "card": {"name": "Sol Ring"}},
                {"quantity": 1, "card": {}}
            ]
        });
        let deck = normalize_deck(&raw).unwrap();
        assert_eq!(deck.cards.len(), 2);
        assert_eq!(deck.commanders()[0].name, "Edgar Markov");
        assert_eq!(deck.cards[1].quantity, 1);
        assert_eq!(deck.author, "");
    }

    #[test]
    fn deck_without_id_is_malformed() {
        let err = normalize_deck(&json!({"name": "no id"})).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }

    #[tokio::test]
    async fn fetch_one_treats_error_body_as_missing_deck() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/decks/99/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "Deck is private"})),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        assert!(adapter.fetch_one("99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_page_sends_listing_filters_and_reads_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/decks/"))
            .and(query_param("page", "2"))
            .and(query_param("pageSize", "50"))
            .and(query_param("formats", "3"))
            .and(query_param("orderBy", "-createdAt"))
            .and(query_param("owner__isnull", "false"))
            .and(query_param("public", "true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(read_fixture("archidekt/bulk_page.json")),
            )
            .mount(&server)
            .await;

        let listing = adapter(&server.uri()).fetch_bulk(2, 50).await.unwrap();
        assert_eq!(listing.malformed, 0);
        assert_eq!(listing.decks.len(), 2);
        assert_eq!(listing.decks[0].source_deck_id, "2000001");
        assert_eq!(listing.decks[1].commanders().len(), 2);
    }

    #[tokio::test]
    async fn bulk_page_counts_decks_it_cannot_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/decks/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": 1, "name": "ok", "cards": []},
                    {"name": "no id"},
                    {"id": 3, "cards": [{"quantity": 4_294_967_296u64, "card": {"name": "Forest"}}]}
                ]
            })))
            .mount(&server)
            .await;

        let listing = adapter(&server.uri()).fetch_bulk(1, 50).await.unwrap();
        assert_eq!(listing.decks.len(), 1);
        assert_eq!(listing.malformed, 2);
        assert!(!listing.is_exhausted());
    }

    #[tokio::test]
    async fn payload_keeps_the_reported_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/decks/7/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "Not found"})))
            .mount(&server)
            .await;

        let payload = adapter(&server.uri()).fetch_payload("7").await.unwrap();
        assert_eq!(payload, DeckPayload::Rejected("Not found".into()));
    }

    #[tokio::test]
    async fn total_pages_rounds_count_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/decks/cards/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 101})))
            .mount(&server)
            .await;

        assert_eq!(adapter(&server.uri()).total_pages(50).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn discover_searches_each_commander_by_views() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/decks"))
            .and(query_param("commanderName", "Atraxa, Praetors' Voice"))
            .and(query_param("orderBy", "-viewCount"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(read_fixture("archidekt/search_page.html")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/decks"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
            .mount(&server)
            .await;

        let options = DiscoveryOptions {
            commanders: vec!["Atraxa, Praetors' Voice".into()],
            max_pages: 2,
            politeness: std::time::Duration::ZERO,
            max_ids: None,
        };
        let ids = adapter(&server.uri()).discover(&options).await.unwrap();
        assert_eq!(ids.len(), 3);
    }
}
