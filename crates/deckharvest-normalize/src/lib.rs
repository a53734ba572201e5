//! Card-name normalization: a name → canonical-id index built from a bulk reference dataset.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckharvest_core::ReferenceCard;
use deckharvest_storage::RequestError;
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod reference;

pub use reference::{BulkMetadata, DatasetStatus, ScryfallBulkSource};

pub const CRATE_NAME: &str = "deckharvest-normalize";

/// Oracle ids of the basic lands, used when the index has no entry for them.
pub const BASIC_LANDS: [(&str, &str); 5] = [
    ("plains", "bc71ebf6-2056-41f7-be35-b2e5c34afa99"),
    ("island", "8cff7b58-bd58-4911-a6a3-bdd1dbf71a72"),
    ("swamp", "a3fb7228-e76b-4e96-a40e-20b5fed75685"),
    ("mountain", "8cf3dce3-01e4-4fe2-ac44-b13b6fe8799e"),
    ("forest", "b34bb2dc-c1af-4d77-b0b3-a0fb342a5fc6"),
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("reference metadata: {0}")]
    Metadata(String),
    #[error("reference dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reference dataset is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Dataset(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn fold_char(c: char, out: &mut String) {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => out.push('a'),
        'é' | 'è' | 'ê' | 'ë' => out.push('e'),
        'í' | 'ì' | 'î' | 'ï' => out.push('i'),
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => out.push('o'),
        'ú' | 'ù' | 'û' | 'ü' => out.push('u'),
        'ñ' => out.push('n'),
        'ç' => out.push('c'),
        'æ' => out.push_str("ae"),
        'œ' => out.push_str("oe"),
        '\u{2018}' | '\u{2019}' | '\u{02bc}' | '`' | '\u{00b4}' => out.push('\''),
        '\u{201c}' | '\u{201d}' | '\u{201e}' => out.push('"'),
        other => out.push(other),
    }
}

/// Case-fold, collapse whitespace and canonicalize a fixed set of diacritics and quotes.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for (i, word) in lowered.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        for c in word.chars() {
            fold_char(c, &mut out);
        }
    }
    out
}

fn name_variations(key: &str) -> [String; 4] {
    [
        key.replace('"', ""),
        key.replace('\'', ""),
        key.replace('\'', "\u{2019}"),
        key.replace(',', ""),
    ]
}

fn basic_land(key: &str) -> Option<&'static str> {
    BASIC_LANDS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, id)| *id)
}

/// Normalized name → canonical id, many-to-one.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    entries: HashMap<String, String>,
}

impl NameIndex {
    pub fn build(cards: &[ReferenceCard]) -> Self {
        let mut index = Self::default();
        for card in cards {
            for name in std::iter::once(&card.primary_name).chain(card.alternate_names.iter()) {
                index.insert_name(name, &card.canonical_id);
                if name.contains("//") {
                    for half in name.split("//") {
                        index.insert_name(half, &card.canonical_id);
                    }
                }
            }
        }
        index
    }

    fn insert_name(&mut self, name: &str, canonical_id: &str) {
        let key = normalize_name(name);
        if !key.is_empty() {
            self.entries.insert(key, canonical_id.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Direct hit, then textual variations, then basic lands. Fallback hits are memoized.
    pub fn resolve(&mut self, name: &str) -> Option<String> {
        let key = normalize_name(name);
        if key.is_empty() {
            return None;
        }
        if let Some(id) = self.entries.get(&key) {
            return Some(id.clone());
        }

        let fallback = name_variations(&key)
            .iter()
            .find_map(|variant| self.entries.get(variant).cloned())
            .or_else(|| basic_land(&key).map(str::to_string));

        if let Some(id) = &fallback {
            debug!(name, key = %key, "memoizing fallback match");
            self.entries.insert(key, id.clone());
        }
        fallback
    }

    fn suggest(&self, name: &str, limit: usize) -> Vec<Suggestion> {
        let key = normalize_name(name);
        let mut scored = self
            .entries
            .iter()
            .map(|(candidate, id)| Suggestion {
                name: candidate.clone(),
                canonical_id: id.clone(),
                score: jaro_winkler(&key, candidate),
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        scored.truncate(limit);
        scored
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Stale at every process start and after the cadence.
    #[default]
    Process,
    /// On first use, a local dataset file younger than the cadence is trusted as-is.
    DatasetFile,
}

impl FromStr for RefreshPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(RefreshPolicy::Process),
            "dataset-file" | "dataset_file" => Ok(RefreshPolicy::DatasetFile),
            other => Err(format!("unknown refresh policy {other:?}")),
        }
    }
}

/// How much a reference source may trust what it already has on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFreshness {
    CheckRemote,
    AcceptLocalYoungerThan(Duration),
}

/// Supplies the full reference dataset.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn load(&self, freshness: DatasetFreshness) -> Result<Vec<ReferenceCard>, NormalizeError>;
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub refresh_cadence: Duration,
    pub policy: RefreshPolicy,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            refresh_cadence: Duration::from_secs(24 * 3600),
            policy: RefreshPolicy::Process,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub name: String,
    pub canonical_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizerStats {
    pub mappings: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub needs_refresh: bool,
}

#[derive(Debug)]
struct ReadyIndex {
    index: NameIndex,
    built_at: DateTime<Utc>,
}

/// Stale/ready state machine around a `NameIndex`.
pub struct CardNormalizer {
    source: Arc<dyn ReferenceSource>,
    config: NormalizerConfig,
    state: Mutex<Option<ReadyIndex>>,
}

impl CardNormalizer {
    pub fn new(source: Arc<dyn ReferenceSource>, config: NormalizerConfig) -> Self {
        Self {
            source,
            config,
            state: Mutex::new(None),
        }
    }

    fn is_stale(&self, state: &Option<ReadyIndex>) -> bool {
        match state {
            None => true,
            Some(ready) => {
                let age = Utc::now().signed_duration_since(ready.built_at);
                age.to_std().unwrap_or(Duration::ZERO) >= self.config.refresh_cadence
            }
        }
    }

    pub async fn needs_refresh(&self) -> bool {
        let state = self.state.lock().await;
        self.is_stale(&state)
    }

    async fn refresh_locked(&self, state: &mut Option<ReadyIndex>) -> Result<(), NormalizeError> {
        let freshness = match (self.config.policy, state.is_none()) {
            (RefreshPolicy::DatasetFile, true) => {
                DatasetFreshness::AcceptLocalYoungerThan(self.config.refresh_cadence)
            }
            _ => DatasetFreshness::CheckRemote,
        };
        let cards = self.source.load(freshness).await?;
        let index = NameIndex::build(&cards);
        info!(
            reference_cards = cards.len(),
            mappings = index.len(),
            "built card name index"
        );
        *state = Some(ReadyIndex {
            index,
            built_at: Utc::now(),
        });
        Ok(())
    }

    /// Stale → ready: refresh the dataset if needed and rebuild the index from scratch.
    pub async fn ensure_ready(&self) -> Result<(), NormalizeError> {
        let mut state = self.state.lock().await;
        if self.is_stale(&state) {
            self.refresh_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn resolve(&self, name: &str) -> Result<Option<String>, NormalizeError> {
        let mut state = self.state.lock().await;
        if self.is_stale(&state) {
            self.refresh_locked(&mut state).await?;
        }
        Ok(state.as_mut().and_then(|ready| ready.index.resolve(name)))
    }

    /// Resolve many names against one ready index. Keys are the input names.
    pub async fn resolve_batch<I, S>(
        &self,
        names: I,
    ) -> Result<BTreeMap<String, Option<String>>, NormalizeError>
    where
        I: IntoIterator<Item = S> + Send,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        if self.is_stale(&state) {
            self.refresh_locked(&mut state).await?;
        }
        let Some(ready) = state.as_mut() else {
            return Ok(BTreeMap::new());
        };
        Ok(names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                (name.to_string(), ready.index.resolve(name))
            })
            .collect())
    }

    /// Closest index keys by Jaro-Winkler similarity. Never changes resolution.
    pub async fn suggest(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<Suggestion>, NormalizeError> {
        let mut state = self.state.lock().await;
        if self.is_stale(&state) {
            self.refresh_locked(&mut state).await?;
        }
        Ok(state
            .as_ref()
            .map(|ready| ready.index.suggest(name, limit))
            .unwrap_or_default())
    }

    pub async fn stats(&self) -> NormalizerStats {
        let state = self.state.lock().await;
        NormalizerStats {
            mappings: state.as_ref().map(|r| r.index.len()).unwrap_or(0),
            built_at: state.as_ref().map(|r| r.built_at),
            needs_refresh: self.is_stale(&state),
        }
    }
}

impl std::fmt::Debug for CardNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardNormalizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
