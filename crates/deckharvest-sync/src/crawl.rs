//! Batch commander crawl: per-commander id files plus one consolidated id list, then
//! one raw deck file per consolidated id.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use deckharvest_adapters::discovery::{discover_deck_ids_for_commanders, politeness_delay};
use deckharvest_adapters::{AdapterError, ArchidektAdapter, DeckPayload, SearchPageSource};
use deckharvest_storage::write_atomic;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const CONSOLIDATED_FILE: &str = "consolidated_deck_ids.json";

#[derive(Debug, Serialize)]
struct CommanderFile<'a> {
    commander: &'a str,
    deck_ids: Vec<&'a str>,
    total_decks: usize,
    crawl_timestamp: String,
    max_pages_searched: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CommanderCount<'a> {
    commander: &'a str,
    deck_count: usize,
}

#[derive(Debug, Serialize)]
struct ConsolidatedFile<'a> {
    unique_deck_ids: Vec<&'a str>,
    total_unique: usize,
    commanders: Vec<CommanderCount<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub commanders: usize,
    pub failed: usize,
    pub unique_deck_ids: usize,
    pub consolidated_path: PathBuf,
}

/// Commander names from a text file: one per line, blanks and `#` comments skipped.
pub fn parse_commander_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// `Atraxa, Praetors' Voice` → `atraxa_praetors_voice.json`.
pub fn commander_file_name(commander: &str) -> String {
    let kept = commander
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>();
    let slug = kept.trim_end().replace(' ', "_").to_lowercase();
    if slug.is_empty() {
        "commander.json".to_string()
    } else {
        format!("{slug}.json")
    }
}

fn numeric_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

pub async fn crawl_commanders(
    source: &dyn SearchPageSource,
    commanders_file: &Path,
    out_dir: &Path,
    max_pages: u32,
    politeness: Duration,
) -> Result<CrawlSummary> {
    let text = tokio::fs::read_to_string(commanders_file)
        .await
        .with_context(|| format!("reading {}", commanders_file.display()))?;
    let commanders = parse_commander_list(&text);
    anyhow::ensure!(
        !commanders.is_empty(),
        "no commanders listed in {}",
        commanders_file.display()
    );
    info!(
        commanders = commanders.len(),
        max_pages,
        out = %out_dir.display(),
        "crawl started"
    );

    let results =
        discover_deck_ids_for_commanders(source, &commanders, max_pages, politeness).await;

    let crawl_timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut unique = BTreeSet::new();
    for result in &results {
        let file = CommanderFile {
            commander: &result.commander,
            deck_ids: result.deck_ids.iter().map(String::as_str).collect(),
            total_decks: result.deck_ids.len(),
            crawl_timestamp: crawl_timestamp.clone(),
            max_pages_searched: max_pages,
            error: result.error.as_deref(),
        };
        let path = out_dir.join(commander_file_name(&result.commander));
        write_json(&path, &file).await?;
        info!(
            commander = %result.commander,
            decks = file.total_decks,
            path = %path.display(),
            "commander saved"
        );
        unique.extend(result.deck_ids.iter().map(String::as_str));
    }

    let mut unique_deck_ids = unique.into_iter().collect::<Vec<_>>();
    unique_deck_ids.sort_by(|a, b| numeric_order(a, b));
    let consolidated = ConsolidatedFile {
        total_unique: unique_deck_ids.len(),
        unique_deck_ids,
        commanders: results
            .iter()
            .map(|r| CommanderCount {
                commander: &r.commander,
                deck_count: r.deck_ids.len(),
            })
            .collect(),
    };
    let consolidated_path = out_dir.join(CONSOLIDATED_FILE);
    write_json(&consolidated_path, &consolidated).await?;

    Ok(CrawlSummary {
        commanders: results.len(),
        failed: results.iter().filter(|r| r.error.is_some()).count(),
        unique_deck_ids: consolidated.total_unique,
        consolidated_path,
    })
}

/// Raw deck JSON by id.
#[async_trait]
pub trait DeckPayloadSource: Send + Sync {
    async fn fetch_payload(&self, id: &str) -> Result<DeckPayload, AdapterError>;
}

#[async_trait]
impl DeckPayloadSource for ArchidektAdapter {
    async fn fetch_payload(&self, id: &str) -> Result<DeckPayload, AdapterError> {
        ArchidektAdapter::fetch_payload(self, id).await
    }
}

#[derive(Debug, Clone)]
pub struct FetchDecksOptions {
    /// Ids skipped from the front of the consolidated list.
    pub start_from: usize,
    pub max_decks: Option<usize>,
    pub politeness: Duration,
}

impl Default for FetchDecksOptions {
    fn default() -> Self {
        Self {
            start_from: 0,
            max_decks: None,
            politeness: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub requested: usize,
    pub fetched: usize,
    pub failed: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeckIdValue {
    Text(String),
    Number(u64),
}

impl DeckIdValue {
    fn into_string(self) -> String {
        match self {
            DeckIdValue::Text(id) => id,
            DeckIdValue::Number(id) => id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConsolidatedIds {
    #[serde(default)]
    unique_deck_ids: Vec<DeckIdValue>,
}

#[derive(Debug, Serialize)]
struct FetchedDeck<'a> {
    deck_id: &'a str,
    deck_data: JsonValue,
    success: bool,
}

#[derive(Debug, Serialize)]
struct FailedDeck<'a> {
    deck_id: &'a str,
    error: String,
    success: bool,
    fetch_timestamp: String,
}

pub fn deck_file_name(deck_id: &str) -> String {
    format!("deck_{deck_id}.json")
}

/// A deck file counts as done only when it records a successful fetch.
async fn already_fetched(path: &Path) -> bool {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return false;
    };
    serde_json::from_slice::<JsonValue>(&bytes)
        .ok()
        .and_then(|saved| saved.get("success").and_then(JsonValue::as_bool))
        .unwrap_or(false)
}

/// Fetch every id listed in a consolidated crawl file into `deck_{id}.json` under `out_dir`.
///
/// Each deck is written whether the fetch worked or not; a failed file is retried on the
/// next pass, a successful one is left alone.
pub async fn fetch_deck_lists(
    source: &dyn DeckPayloadSource,
    ids_file: &Path,
    out_dir: &Path,
    options: &FetchDecksOptions,
) -> Result<FetchSummary> {
    let bytes = tokio::fs::read(ids_file)
        .await
        .with_context(|| format!("reading {}", ids_file.display()))?;
    let consolidated: ConsolidatedIds = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", ids_file.display()))?;
    anyhow::ensure!(
        !consolidated.unique_deck_ids.is_empty(),
        "no deck ids listed in {}",
        ids_file.display()
    );

    let ids = consolidated
        .unique_deck_ids
        .into_iter()
        .map(DeckIdValue::into_string)
        .skip(options.start_from)
        .take(options.max_decks.unwrap_or(usize::MAX))
        .collect::<Vec<_>>();
    info!(decks = ids.len(), out = %out_dir.display(), "deck fetch started");

    let mut summary = FetchSummary {
        requested: ids.len(),
        ..FetchSummary::default()
    };
    let mut fetched_any = false;
    for deck_id in &ids {
        if deck_id.is_empty() || !deck_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            warn!(deck_id = %deck_id, "skipping unusable deck id");
            summary.failed += 1;
            continue;
        }
        let path = out_dir.join(deck_file_name(deck_id));
        if already_fetched(&path).await {
            summary.skipped_existing += 1;
            continue;
        }
        if fetched_any {
            tokio::time::sleep(politeness_delay(options.politeness)).await;
        }
        fetched_any = true;

        let outcome = match source.fetch_payload(deck_id).await {
            Ok(DeckPayload::Found(deck_data)) => Ok(deck_data),
            Ok(DeckPayload::Rejected(error)) => Err(error),
            Err(err) => Err(err.to_string()),
        };
        let bytes = match outcome {
            Ok(deck_data) => {
                summary.fetched += 1;
                serde_json::to_vec_pretty(&FetchedDeck {
                    deck_id,
                    deck_data,
                    success: true,
                })?
            }
            Err(error) => {
                warn!(deck_id = %deck_id, error = %error, "deck fetch failed");
                summary.failed += 1;
                serde_json::to_vec_pretty(&FailedDeck {
                    deck_id,
                    error,
                    success: false,
                    fetch_timestamp: Utc::now().to_rfc3339(),
                })?
            }
        };
        write_atomic(&path, &bytes).await?;
    }

    info!(
        fetched = summary.fetched,
        failed = summary.failed,
        skipped_existing = summary.skipped_existing,
        "deck fetch finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Page 1 only; Atraxa and Edgar share deck 900.
    struct CannedSearch;

    #[async_trait]
    impl SearchPageSource for CannedSearch {
        async fn search_page(
            &self,
            commander_name: &str,
            _order_by: &str,
            page: u32,
        ) -> Result<String, AdapterError> {
            if page > 1 {
                return Ok("<html><body>No results</body></html>".into());
            }
            let links = match commander_name {
                "Atraxa, Praetors' Voice" => {
                    r#"<a href="/decks/900/atraxa">a</a><a href="/decks/15/superfriends">b</a>"#
                }
                "Edgar Markov" => {
                    r#"<a href="/decks/900/edgar">a</a><a href="/decks/1200/vamps">b</a>"#
                }
                _ => return Err(AdapterError::Message("search unavailable".into())),
            };
            Ok(format!("<html><body>{links}</body></html>"))
        }
    }

    fn read_json(path: &Path) -> JsonValue {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn commander_list_skips_blanks_and_comments() {
        let list = parse_commander_list(
            "# popular\nAtraxa, Praetors' Voice\n\n  Edgar Markov  \n#Korvold\n",
        );
        assert_eq!(list, vec!["Atraxa, Praetors' Voice", "Edgar Markov"]);
    }

    #[test]
    fn file_names_keep_word_characters_only() {
        assert_eq!(
            commander_file_name("Atraxa, Praetors' Voice"),
            "atraxa_praetors_voice.json"
        );
        assert_eq!(commander_file_name("Jhoira of the Ghitu "), "jhoira_of_the_ghitu.json");
        assert_eq!(
            commander_file_name("Ghired, Conclave-Exile"),
            "ghired_conclave-exile.json"
        );
        assert_eq!(commander_file_name("!!!"), "commander.json");
    }

    #[tokio::test]
    async fn crawl_writes_one_file_per_commander_and_a_numeric_union() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("commanders.txt");
        std::fs::write(&list, "Atraxa, Praetors' Voice\nEdgar Markov\nNobody Special\n")
            .unwrap();
        let out = dir.path().join("out");

        let summary = crawl_commanders(&CannedSearch, &list, &out, 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(summary.commanders, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unique_deck_ids, 3);

        let atraxa = read_json(&out.join("atraxa_praetors_voice.json"));
        assert_eq!(atraxa["commander"], "Atraxa, Praetors' Voice");
        assert_eq!(atraxa["total_decks"], 2);
        assert_eq!(atraxa["max_pages_searched"], 2);
        assert!(atraxa.get("error").is_none());

        let nobody = read_json(&out.join("nobody_special.json"));
        assert_eq!(nobody["total_decks"], 0);
        assert!(nobody["error"].as_str().unwrap().contains("unavailable"));

        let consolidated = read_json(&summary.consolidated_path);
        assert_eq!(
            consolidated["unique_deck_ids"],
            json!(["15", "900", "1200"])
        );
        assert_eq!(consolidated["total_unique"], 3);
        assert_eq!(consolidated["commanders"][1]["deck_count"], 2);
    }

    #[tokio::test]
    async fn empty_commander_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("commanders.txt");
        std::fs::write(&list, "# nothing yet\n\n").unwrap();

        let err = crawl_commanders(&CannedSearch, &list, dir.path(), 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no commanders"));
    }

    /// Serves canned deck payloads and records which ids were asked for.
    #[derive(Default)]
    struct CannedDecks {
        payloads: HashMap<&'static str, DeckPayload>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeckPayloadSource for CannedDecks {
        async fn fetch_payload(&self, id: &str) -> Result<DeckPayload, AdapterError> {
            self.requested.lock().unwrap().push(id.to_string());
            self.payloads
                .get(id)
                .cloned()
                .ok_or_else(|| AdapterError::Message(format!("deck {id} timed out")))
        }
    }

    fn canned_decks() -> CannedDecks {
        CannedDecks {
            payloads: HashMap::from([
                ("15", DeckPayload::Found(json!({"id": 15, "name": "Superfriends"}))),
                ("900", DeckPayload::Rejected("deck is private".into())),
                ("1200", DeckPayload::Found(json!({"id": 1200, "name": "Vamps"}))),
            ]),
            ..CannedDecks::default()
        }
    }

    fn write_ids(dir: &Path, ids: JsonValue) -> PathBuf {
        let path = dir.join(CONSOLIDATED_FILE);
        let body = json!({"unique_deck_ids": ids, "total_unique": 0, "commanders": []});
        std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
        path
    }

    fn no_delay() -> FetchDecksOptions {
        FetchDecksOptions {
            politeness: Duration::ZERO,
            ..FetchDecksOptions::default()
        }
    }

    #[tokio::test]
    async fn deck_fetch_writes_successes_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_ids(dir.path(), json!(["15", "900", 1200, "31337"]));
        let out = dir.path().join("decks");
        let source = canned_decks();

        let summary = fetch_deck_lists(&source, &ids, &out, &no_delay()).await.unwrap();
        assert_eq!(
            summary,
            FetchSummary {
                requested: 4,
                fetched: 2,
                failed: 2,
                skipped_existing: 0,
            }
        );

        let saved = read_json(&out.join("deck_15.json"));
        assert_eq!(saved["success"], true);
        assert_eq!(saved["deck_id"], "15");
        assert_eq!(saved["deck_data"]["name"], "Superfriends");

        let private = read_json(&out.join("deck_900.json"));
        assert_eq!(private["success"], false);
        assert_eq!(private["error"], "deck is private");
        assert!(private["fetch_timestamp"].is_string());

        let timed_out = read_json(&out.join("deck_31337.json"));
        assert!(timed_out["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(read_json(&out.join("deck_1200.json"))["deck_data"]["id"], 1200);
    }

    #[tokio::test]
    async fn second_pass_retries_only_failed_decks() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_ids(dir.path(), json!(["15", "900", "1200"]));
        let out = dir.path().join("decks");

        fetch_deck_lists(&canned_decks(), &ids, &out, &no_delay()).await.unwrap();
        let source = canned_decks();
        let summary = fetch_deck_lists(&source, &ids, &out, &no_delay()).await.unwrap();

        assert_eq!(summary.skipped_existing, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(*source.requested.lock().unwrap(), vec!["900".to_string()]);
    }

    #[tokio::test]
    async fn start_offset_and_cap_select_a_window() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_ids(dir.path(), json!(["15", "900", "1200"]));
        let out = dir.path().join("decks");
        let source = canned_decks();
        let options = FetchDecksOptions {
            start_from: 2,
            max_decks: Some(5),
            ..no_delay()
        };

        let summary = fetch_deck_lists(&source, &ids, &out, &options).await.unwrap();
        assert_eq!(summary.requested, 1);
        assert_eq!(summary.fetched, 1);
        assert_eq!(*source.requested.lock().unwrap(), vec!["1200".to_string()]);
        assert!(!out.join("deck_15.json").exists());
    }

    #[tokio::test]
    async fn empty_id_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_ids(dir.path(), json!([]));

        let err = fetch_deck_lists(&canned_decks(), &ids, dir.path(), &no_delay())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no deck ids"));
    }
}
