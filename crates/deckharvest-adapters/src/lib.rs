//! Source adapter capabilities + Archidekt/Moxfield implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deckharvest_core::{DeckIdentifier, NormalizedDeck, Zone, COMMANDER_CARD_RANGE};
use deckharvest_storage::{RequestEngine, RequestError};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod archidekt;
pub mod browser;
pub mod discovery;
pub mod moxfield;

pub use archidekt::{ArchidektAdapter, DeckPayload};
pub use browser::{BrowserError, BrowserSession, BrowserlessRenderer, PageRenderer};
pub use discovery::{CommanderDiscovery, SearchPageSource};
pub use moxfield::MoxfieldAdapter;

pub const CRATE_NAME: &str = "deckharvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("malformed {source_name} payload: {message}")]
    Malformed {
        source_name: &'static str,
        message: String,
    },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("{source_name} does not support {capability}")]
    Unsupported {
        source_name: &'static str,
        capability: &'static str,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub(crate) fn malformed(source_name: &'static str, message: impl Into<String>) -> Self {
        AdapterError::Malformed {
            source_name,
            message: message.into(),
        }
    }
}

/// Knobs for one `discover` call.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub commanders: Vec<String>,
    pub max_pages: u32,
    pub politeness: Duration,
    pub max_ids: Option<usize>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            commanders: Vec::new(),
            max_pages: 3,
            politeness: Duration::from_secs(5),
            max_ids: None,
        }
    }
}

/// Every adapter can fetch one deck; the rest are optional capabilities.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// `Ok(None)` when the source reports no such deck.
    async fn fetch_one(&self, id: &str) -> Result<Option<NormalizedDeck>, AdapterError>;

    fn as_discoverable(&self) -> Option<&dyn Discoverable> {
        None
    }

    fn as_bulk(&self) -> Option<&dyn BulkFetchable> {
        None
    }

    fn as_browser_fallback(&self) -> Option<&dyn BrowserFallback> {
        None
    }
}

#[async_trait]
pub trait Discoverable: Send + Sync {
    async fn discover(&self, options: &DiscoveryOptions)
        -> Result<Vec<DeckIdentifier>, AdapterError>;
}

/// One page of a bulk listing. `malformed` counts listed decks that could not be read.
#[derive(Debug, Clone, Default)]
pub struct BulkPage {
    pub decks: Vec<NormalizedDeck>,
    pub malformed: u64,
}

impl BulkPage {
    /// True when the listing had nothing at all on this page.
    pub fn is_exhausted(&self) -> bool {
        self.decks.is_empty() && self.malformed == 0
    }
}

#[async_trait]
pub trait BulkFetchable: Send + Sync {
    async fn fetch_bulk(&self, page: u32, page_size: u32) -> Result<BulkPage, AdapterError>;

    async fn total_pages(&self, page_size: u32) -> Result<u32, AdapterError>;
}

#[async_trait]
pub trait BrowserFallback: Send + Sync {
    fn browser(&self) -> Option<&Arc<BrowserSession>>;

    /// Shut the browser session down if one was started. Safe to call repeatedly.
    async fn release_browser(&self) {
        if let Some(session) = self.browser() {
            if let Err(err) = session.release().await {
                warn!(error = %err, "failed to release browser session");
            }
        }
    }
}

/// Per-source construction inputs shared by the registry.
#[derive(Clone)]
pub struct AdapterContext {
    pub engine: Arc<RequestEngine>,
    pub base_url: String,
    pub format_filter: Option<u32>,
    pub browser: Option<Arc<BrowserSession>>,
}

pub fn adapter_for_source(
    source_name: &str,
    ctx: AdapterContext,
) -> Option<Box<dyn SourceAdapter>> {
    match source_name {
        archidekt::SOURCE_NAME => Some(Box::new(ArchidektAdapter::new(
            ctx.engine,
            ctx.base_url,
            ctx.format_filter.unwrap_or(archidekt::COMMANDER_FORMAT_ID),
        ))),
        moxfield::SOURCE_NAME => Some(Box::new(MoxfieldAdapter::new(
            ctx.engine,
            ctx.base_url,
            ctx.browser,
        ))),
        _ => None,
    }
}

/// Log, never reject, decks whose size or commander set looks off.
pub(crate) fn sanity_check(
    source_name: &'static str,
    deck: &NormalizedDeck,
    counted_zone: Option<Zone>,
) {
    let total = match counted_zone {
        Some(zone) => deck.zone_quantity(zone),
        None => deck.total_quantity(),
    };
    if !COMMANDER_CARD_RANGE.contains(&total) {
        warn!(
            source = source_name,
            deck_id = %deck.source_deck_id,
            total,
            "deck card count outside the expected commander range"
        );
    }
    if deck.commanders().is_empty() {
        warn!(
            source = source_name,
            deck_id = %deck.source_deck_id,
            "deck has no identified commander"
        );
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn select_all_attrs(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Vec<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(text_or_none)
        .collect())
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    json_at(value, path)?.as_u64()
}

/// Card quantity of a list entry, 1 when absent. Values past `u32` make the deck malformed.
pub(crate) fn json_quantity(
    source_name: &'static str,
    entry: &JsonValue,
) -> Result<u32, AdapterError> {
    match json_u64(entry, &["quantity"]) {
        None => Ok(1),
        Some(quantity) => u32::try_from(quantity).map_err(|_| {
            AdapterError::malformed(source_name, format!("card quantity {quantity} out of range"))
        }),
    }
}

/// Copy the listed fields into `extra` under new keys, with a default when absent.
pub(crate) fn copy_extra(
    raw: &JsonValue,
    fields: &[(&str, &str, JsonValue)],
) -> serde_json::Map<String, JsonValue> {
    fields
        .iter()
        .map(|(key, from, default)| {
            let value = raw
                .get(*from)
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| default.clone());
            (key.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn read_fixture(rel: &str) -> String {
        let path = workspace_root().join("fixtures").join(rel);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckharvest_storage::{RateLimiter, RequestEngineConfig};
    use serde_json::json;

    #[test]
    fn json_helpers_walk_nested_paths() {
        let raw = json!({"owner": {"username": "brew"}, "viewCount": 12});
        assert_eq!(json_str(&raw, &["owner", "username"]), Some("brew"));
        assert_eq!(json_u64(&raw, &["viewCount"]), Some(12));
        assert_eq!(json_str(&raw, &["owner", "missing"]), None);
    }

    #[test]
    fn quantity_defaults_to_one_and_rejects_overflow() {
        assert_eq!(json_quantity("archidekt", &json!({})).unwrap(), 1);
        assert_eq!(json_quantity("archidekt", &json!({"quantity": 4})).unwrap(), 4);
        let err = json_quantity("archidekt", &json!({"quantity": 4_294_967_296u64})).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed { .. }));
    }

    #[test]
    fn copy_extra_falls_back_to_defaults() {
        let raw = json!({"viewCount": 7, "createdAt": null});
        let extra = copy_extra(
            &raw,
            &[
                ("views", "viewCount", json!(0)),
                ("created_at", "createdAt", JsonValue::Null),
                ("featured", "featured", json!(false)),
            ],
        );
        assert_eq!(extra["views"], json!(7));
        assert_eq!(extra["created_at"], JsonValue::Null);
        assert_eq!(extra["featured"], json!(false));
    }

    #[test]
    fn registry_exposes_capabilities_per_source() {
        let engine = Arc::new(
            RequestEngine::new(
                "test",
                Arc::new(RateLimiter::disabled()),
                RequestEngineConfig::default(),
            )
            .unwrap(),
        );
        let ctx = AdapterContext {
            engine,
            base_url: "http://localhost".into(),
            format_filter: None,
            browser: None,
        };

        let archidekt = adapter_for_source("archidekt", ctx.clone()).unwrap();
        assert!(archidekt.as_bulk().is_some());
        assert!(archidekt.as_discoverable().is_some());
        assert!(archidekt.as_browser_fallback().is_none());

        let moxfield = adapter_for_source("moxfield", ctx.clone()).unwrap();
        assert!(moxfield.as_bulk().is_none());
        assert!(moxfield.as_browser_fallback().is_some());

        assert!(adapter_for_source("tappedout", ctx).is_none());
    }
}
