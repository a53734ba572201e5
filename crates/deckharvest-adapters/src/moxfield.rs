use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use deckharvest_core::{CardEntry, DeckIdentifier, NormalizedDeck, Zone};
use deckharvest_storage::RequestEngine;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::{
    copy_extra, json_at, json_quantity, json_str, sanity_check, AdapterError, BrowserFallback,
    Discoverable, DiscoveryOptions, SourceAdapter,
};

pub const SOURCE_NAME: &str = "moxfield";
pub const DEFAULT_SITE_URL: &str = "https://www.moxfield.com";

const DISCOVERY_COMMANDER_LIMIT: usize = 3;
const DISCOVERY_ID_LIMIT: usize = 100;
const SEARCH_PAGE_SIZE: u32 = 50;
const BROWSE_LINK_LIMIT: usize = 20;

fn deck_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/decks/([a-zA-Z0-9_-]+)").expect("deck link pattern is valid"))
}

fn initial_state_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"window\.__INITIAL_STATE__\s*=\s*").expect("initial state pattern is valid")
    })
}

/// Discovery via the search API, deck detail via the API with a rendered-page fallback.
pub struct MoxfieldAdapter {
    engine: Arc<RequestEngine>,
    base_url: String,
    site_url: String,
    browser: Option<Arc<BrowserSession>>,
    use_browser: AtomicBool,
}

impl MoxfieldAdapter {
    pub fn new(
        engine: Arc<RequestEngine>,
        base_url: impl Into<String>,
        browser: Option<Arc<BrowserSession>>,
    ) -> Self {
        Self {
            engine,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
            browser,
            use_browser: AtomicBool::new(false),
        }
    }

    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = site_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn engine(&self) -> &Arc<RequestEngine> {
        &self.engine
    }

    /// True once a direct request has failed and the adapter switched to rendering.
    pub fn in_browser_mode(&self) -> bool {
        self.use_browser.load(Ordering::Relaxed)
    }

    async fn search_api_page(
        &self,
        commander: &str,
        page: u32,
    ) -> Result<Vec<String>, AdapterError> {
        let url = format!("{}/v2/decks/search", self.base_url);
        let params = [
            ("format", "commander".to_string()),
            ("commander", commander.to_string()),
            ("page", page.to_string()),
            ("pageSize", SEARCH_PAGE_SIZE.to_string()),
        ];
        let data: JsonValue = self
            .engine
            .get(&url, &params, None)
            .await?
            .json()
            .map_err(|e| AdapterError::malformed(SOURCE_NAME, format!("search page: {e}")))?;

        Ok(data
            .get("data")
            .and_then(|d| d.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|deck| json_str(deck, &["visibility"]) == Some("public"))
            .filter_map(|deck| json_str(deck, &["publicId"]))
            .map(str::to_string)
            .collect())
    }

    async fn discover_via_api(&self, commander: &str, max_pages: u32) -> Vec<String> {
        let mut ids = Vec::new();
        for page in 1..=max_pages {
            match self.search_api_page(commander, page).await {
                Ok(page_ids) if page_ids.is_empty() => break,
                Ok(page_ids) => ids.extend(page_ids),
                Err(err) => {
                    warn!(
                        commander,
                        page,
                        error = %err,
                        "moxfield search failed, switching to browser"
                    );
                    self.use_browser.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }
        ids
    }

    async fn discover_via_browser(
        &self,
        session: &BrowserSession,
        commander: &str,
    ) -> Result<Vec<String>, AdapterError> {
        session.acquire().await?;
        let url = format!(
            "{}/decks/browse/commander/{}",
            self.site_url,
            commander.replace(' ', "+")
        );
        let html = session.render(&url).await?;
        Ok(extract_browse_deck_ids(&html))
    }

    async fn fetch_via_api(&self, id: &str) -> Result<NormalizedDeck, AdapterError> {
        let url = format!("{}/v2/decks/all/{id}", self.base_url);
        let raw: JsonValue = self
            .engine
            .get(&url, &[], None)
            .await?
            .json()
            .map_err(|e| AdapterError::malformed(SOURCE_NAME, format!("deck {id}: {e}")))?;
        normalize_deck(&raw, id)
    }

    async fn fetch_via_browser(
        &self,
        session: &BrowserSession,
        id: &str,
    ) -> Result<Option<NormalizedDeck>, AdapterError> {
        session.acquire().await?;
        let html = session.render(&format!("{}/decks/{id}", self.site_url)).await?;
        let Some(state) = extract_initial_state(&html) else {
            warn!(deck_id = id, "rendered deck page has no embedded state");
            return Ok(None);
        };
        match json_at(&state, &["deck", "deck"]).filter(|d| d.is_object()) {
            Some(raw) => normalize_deck(raw, id).map(Some),
            None => Ok(None),
        }
    }
}

/// `/decks/<slug>` links from a rendered browse page, first few only.
pub fn extract_browse_deck_ids(html: &str) -> Vec<String> {
    deck_link_regex()
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .take(BROWSE_LINK_LIMIT)
        .filter(|slug| slug.len() > 5 && *slug != "browse")
        .map(str::to_string)
        .collect()
}

/// Parse the `window.__INITIAL_STATE__ = {...};` blob embedded in a rendered page.
pub fn extract_initial_state(html: &str) -> Option<JsonValue> {
    let start = initial_state_regex().find(html)?.end();
    let mut stream = serde_json::Deserializer::from_str(&html[start..]).into_iter::<JsonValue>();
    match stream.next()? {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "embedded state is not valid JSON");
            None
        }
    }
}

fn board_entries(raw: &JsonValue, board: &str) -> Vec<JsonValue> {
    match raw.get(board) {
        Some(JsonValue::Object(map)) => map.values().cloned().collect(),
        Some(JsonValue::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn card_from_entry(entry: &JsonValue, quantity: u32, zone: Zone) -> Option<CardEntry> {
    let name = json_str(entry, &["card", "name"])?.trim();
    if name.is_empty() {
        return None;
    }
    let canonical_id = json_str(entry, &["card", "oracleId"]).map(str::to_string);
    Some(CardEntry::new(name, quantity, zone).with_canonical_id(canonical_id))
}

/// Translate one Moxfield deck payload. Commanders follow the mainboard with quantity 1.
pub fn normalize_deck(raw: &JsonValue, deck_id: &str) -> Result<NormalizedDeck, AdapterError> {
    if !raw.is_object() {
        return Err(AdapterError::malformed(
            SOURCE_NAME,
            format!("deck {deck_id} is not an object"),
        ));
    }

    let mut cards = Vec::new();
    for entry in &board_entries(raw, "mainboard") {
        let quantity = json_quantity(SOURCE_NAME, entry)?;
        cards.extend(card_from_entry(entry, quantity, Zone::Main));
    }
    cards.extend(
        board_entries(raw, "commanders")
            .iter()
            .filter_map(|entry| card_from_entry(entry, 1, Zone::Command)),
    );

    let mut extra = copy_extra(
        raw,
        &[
            ("description", "description", json!("")),
            ("visibility", "visibility", json!("public")),
            ("likes", "likeCount", json!(0)),
            ("views", "viewCount", json!(0)),
            ("created_at", "createdAtUtc", JsonValue::Null),
            ("updated_at", "lastUpdatedAtUtc", JsonValue::Null),
        ],
    );
    extra.insert("moxfield_id".into(), json!(deck_id));

    let deck = NormalizedDeck {
        source_deck_id: deck_id.to_string(),
        title: json_str(raw, &["name"]).unwrap_or_default().to_string(),
        author: json_str(raw, &["createdByUser", "userName"])
            .unwrap_or_default()
            .to_string(),
        url: format!("{DEFAULT_SITE_URL}/decks/{deck_id}"),
        format: json_str(raw, &["format"]).unwrap_or("commander").to_string(),
        cards,
        extra,
    };
    sanity_check(SOURCE_NAME, &deck, Some(Zone::Main));
    Ok(deck)
}

#[async_trait]
impl SourceAdapter for MoxfieldAdapter {
    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<NormalizedDeck>, AdapterError> {
        let api_err = match self.fetch_via_api(id).await {
            Ok(deck) => return Ok(Some(deck)),
            Err(err) => err,
        };
        let Some(session) = &self.browser else {
            return Err(api_err);
        };
        warn!(deck_id = id, error = %api_err, "moxfield api fetch failed, rendering deck page");
        self.use_browser.store(true, Ordering::Relaxed);
        self.fetch_via_browser(session, id).await
    }

    fn as_discoverable(&self) -> Option<&dyn Discoverable> {
        Some(self)
    }

    fn as_browser_fallback(&self) -> Option<&dyn BrowserFallback> {
        Some(self)
    }
}

#[async_trait]
impl Discoverable for MoxfieldAdapter {
    async fn discover(
        &self,
        options: &DiscoveryOptions,
    ) -> Result<Vec<DeckIdentifier>, AdapterError> {
        let limit = options.max_ids.unwrap_or(DISCOVERY_ID_LIMIT);
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        for commander in options.commanders.iter().take(DISCOVERY_COMMANDER_LIMIT) {
            let mut found = if self.in_browser_mode() {
                Vec::new()
            } else {
                self.discover_via_api(commander, options.max_pages).await
            };

            if found.is_empty() && self.in_browser_mode() {
                if let Some(session) = &self.browser {
                    match self.discover_via_browser(session, commander).await {
                        Ok(browser_ids) => found = browser_ids,
                        Err(err) => {
                            warn!(commander = %commander, error = %err, "browser discovery failed")
                        }
                    }
                }
            }

            for id in found {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            if ids.len() >= limit {
                break;
            }
        }

        ids.truncate(limit);
        info!(discovered = ids.len(), "moxfield discovery finished");
        Ok(ids)
    }
}

#[async_trait]
impl BrowserFallback for MoxfieldAdapter {
    fn browser(&self) -> Option<&Arc<BrowserSession>> {
        self.browser.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::tests::ScriptedRenderer;
    use crate::browser::BrowserSessionConfig;
    use crate::test_support::read_fixture;
    use deckharvest_storage::{BackoffPolicy, RateLimiter, RequestEngineConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> Arc<RequestEngine> {
        let config = RequestEngineConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..RequestEngineConfig::default()
        };
        let limiter = Arc::new(RateLimiter::disabled());
        Arc::new(RequestEngine::new(SOURCE_NAME, limiter, config).unwrap())
    }

    fn session(pages: Vec<String>) -> (Arc<ScriptedRenderer>, Arc<BrowserSession>) {
        let renderer = Arc::new(ScriptedRenderer::new(pages));
        let session = Arc::new(BrowserSession::new(
            renderer.clone(),
            BrowserSessionConfig::default(),
        ));
        (renderer, session)
    }

    #[test]
    fn api_fixture_normalizes_mainboard_then_commanders() {
        let raw: JsonValue = serde_json::from_str(&read_fixture("moxfield/deck.json")).unwrap();
        let deck = normalize_deck(&raw, "mXkT3qQ9zE2b").unwrap();

        assert_eq!(deck.title, "Edgar's Vampire Court");
        assert_eq!(deck.author, "nightfall");
        assert_eq!(deck.url, "https://www.moxfield.com/decks/mXkT3qQ9zE2b");
        assert_eq!(deck.zone_quantity(Zone::Main), 99);
        assert_eq!(deck.cards.last().unwrap().zone, Zone::Command);
        assert_eq!(deck.commanders()[0].name, "Edgar Markov");
        assert_eq!(deck.extra["likes"], json!(31));
        assert_eq!(deck.extra["moxfield_id"], json!("mXkT3qQ9zE2b"));
    }

    #[test]
    fn embedded_state_is_parsed_from_rendered_page() {
        let html = read_fixture("moxfield/rendered_deck.html");
        let state = extract_initial_state(&html).unwrap();
        let raw = json_at(&state, &["deck", "deck"]).unwrap();
        let deck = normalize_deck(raw, "mXkT3qQ9zE2b").unwrap();
        assert_eq!(deck.commanders().len(), 1);
        assert_eq!(deck.cards.len(), 3);
    }

    #[test]
    fn browse_links_skip_short_and_navigation_slugs() {
        let ids = extract_browse_deck_ids(&read_fixture("moxfield/browse.html"));
        assert_eq!(ids, vec!["AbCdEf123".to_string(), "zz_top-77".to_string()]);
    }

    #[test]
    fn oversized_quantity_makes_the_deck_malformed() {
        let raw = json!({
            "name": "t",
            "mainboard": {"Forest": {"quantity": 5_000_000_000u64, "card": {"name": "Forest"}}}
        });
        let err = normalize_deck(&raw, "abcdef").unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }

    #[test]
    fn missing_state_yields_none() {
        assert!(extract_initial_state("<html><script>var x = 1;</script></html>").is_none());
    }

    #[tokio::test]
    async fn api_discovery_keeps_public_ids_and_stops_on_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/decks/search"))
            .and(query_param("page", "1"))
            .and(query_param("format", "commander"))
            .and(query_param("pageSize", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"publicId": "pub-aaaaaa", "visibility": "public"},
                    {"publicId": "unl-bbbbbb", "visibility": "unlisted"},
                    {"publicId": "pub-cccccc", "visibility": "public"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/decks/search"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(2)
            .mount(&server)
            .await;

        let adapter = MoxfieldAdapter::new(engine(), server.uri(), None);
        let options = DiscoveryOptions {
            commanders: vec!["Edgar Markov".into(), "Atraxa".into()],
            max_pages: 3,
            ..DiscoveryOptions::default()
        };
        let ids = adapter.discover(&options).await.unwrap();
        assert_eq!(ids, vec!["pub-aaaaaa".to_string(), "pub-cccccc".to_string()]);
        assert!(!adapter.in_browser_mode());
    }

    #[tokio::test]
    async fn blocked_search_falls_back_to_rendered_browse_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/decks/search"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let (renderer, session) = session(vec![read_fixture("moxfield/browse.html")]);
        let adapter = MoxfieldAdapter::new(engine(), server.uri(), Some(session.clone()));
        let options = DiscoveryOptions {
            commanders: vec!["Edgar Markov".into()],
            max_pages: 3,
            ..DiscoveryOptions::default()
        };

        let ids = adapter.discover(&options).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(adapter.in_browser_mode());
        assert!(session.is_active().await);

        adapter.release_browser().await;
        assert!(!session.is_active().await);
        assert_eq!(
            renderer.shutdowns.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn failed_api_fetch_renders_deck_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/decks/all/mXkT3qQ9zE2b"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let (_renderer, session) = session(vec![read_fixture("moxfield/rendered_deck.html")]);
        let adapter = MoxfieldAdapter::new(engine(), server.uri(), Some(session));

        let deck = adapter.fetch_one("mXkT3qQ9zE2b").await.unwrap().unwrap();
        assert_eq!(deck.source_deck_id, "mXkT3qQ9zE2b");
        assert_eq!(deck.commanders()[0].name, "Edgar Markov");
    }

    #[tokio::test]
    async fn failed_api_fetch_without_browser_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/decks/all/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = MoxfieldAdapter::new(engine(), server.uri(), None);
        let err = adapter.fetch_one("gone").await.unwrap_err();
        assert!(matches!(err, AdapterError::Request(_)));
    }
}
