//! Consumed persistence interface and an in-process implementation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckharvest_core::{
    CardEntry, CommanderRef, JobRun, NormalizedDeck, PendingCard, StoreStats, UnmappedCardRecord,
};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;

/// The operations the ingestion core needs from the deck store.
#[async_trait]
pub trait DeckStore: Send + Sync {
    /// Insert or refresh the deck keyed by `(source_name, source_deck_id)`; returns its row id.
    async fn upsert_deck(&self, source_name: &str, deck: &NormalizedDeck) -> anyhow::Result<i64>;

    /// Delete-then-insert every card row of a deck.
    async fn replace_cards(&self, deck_id: i64, cards: &[CardEntry]) -> anyhow::Result<()>;

    /// Delete-then-insert every commander row of a deck.
    async fn replace_commanders(
        &self,
        deck_id: i64,
        commanders: &[CommanderRef],
    ) -> anyhow::Result<()>;

    async fn log_unmapped_card(&self, name: &str) -> anyhow::Result<()>;

    async fn log_job_run(&self, run: &JobRun) -> anyhow::Result<()>;

    /// `(deck_id, name)` pairs still lacking a canonical id, in key order, starting after
    /// the `after` key when one is given.
    async fn pending_cards(
        &self,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> anyhow::Result<Vec<PendingCard>>;

    /// Set the canonical id of matching card and commander rows that have none yet.
    async fn set_card_canonical_id(
        &self,
        deck_id: i64,
        name: &str,
        canonical_id: &str,
    ) -> anyhow::Result<u64>;

    async fn recent_job_runs(&self, limit: usize) -> anyhow::Result<Vec<JobRun>>;

    async fn unmapped_cards(&self, limit: usize) -> anyhow::Result<Vec<UnmappedCardRecord>>;

    /// Names of unmapped records last seen at or after `since`.
    async fn unmapped_seen_since(&self, since: DateTime<Utc>) -> anyhow::Result<HashSet<String>>;

    async fn stats(&self) -> anyhow::Result<StoreStats>;
}

#[derive(Debug, Clone)]
pub struct StoredDeck {
    pub id: i64,
    pub source_name: String,
    pub source_deck_id: String,
    pub format: String,
    pub title: String,
    pub author: String,
    pub url: String,
    pub extra: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_deck_id: i64,
    decks: Vec<StoredDeck>,
    cards: HashMap<i64, Vec<CardEntry>>,
    commanders: HashMap<i64, Vec<CommanderRef>>,
    unmapped: HashMap<String, UnmappedCardRecord>,
    job_runs: Vec<JobRun>,
}

/// Process-local store, used by tests and by `DECKHARVEST_STORE=memory` dry runs.
#[derive(Debug, Default)]
pub struct MemoryDeckStore {
    state: Mutex<MemoryState>,
}

impl MemoryDeckStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn decks(&self) -> Vec<StoredDeck> {
        self.state.lock().await.decks.clone()
    }

    pub async fn cards_for(&self, deck_id: i64) -> Vec<CardEntry> {
        self.state
            .lock()
            .await
            .cards
            .get(&deck_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn commanders_for(&self, deck_id: i64) -> Vec<CommanderRef> {
        self.state
            .lock()
            .await
            .commanders
            .get(&deck_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn job_runs(&self) -> Vec<JobRun> {
        self.state.lock().await.job_runs.clone()
    }
}

#[async_trait]
impl DeckStore for MemoryDeckStore {
    async fn upsert_deck(&self, source_name: &str, deck: &NormalizedDeck) -> anyhow::Result<i64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing) = state
            .decks
            .iter_mut()
            .find(|d| d.source_name == source_name && d.source_deck_id == deck.source_deck_id)
        {
            existing.format = deck.format.clone();
            existing.title = deck.title.clone();
            existing.author = deck.author.clone();
            existing.url = deck.url.clone();
            existing.extra = deck.extra.clone();
            existing.updated_at = now;
            existing.last_seen_at = now;
            existing.fetched_at = now;
            return Ok(existing.id);
        }

        state.next_deck_id += 1;
        let id = state.next_deck_id;
        state.decks.push(StoredDeck {
            id,
            source_name: source_name.to_string(),
            source_deck_id: deck.source_deck_id.clone(),
            format: deck.format.clone(),
            title: deck.title.clone(),
            author: deck.author.clone(),
            url: deck.url.clone(),
            extra: deck.extra.clone(),
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            fetched_at: now,
        });
        Ok(id)
    }

    async fn replace_cards(&self, deck_id: i64, cards: &[CardEntry]) -> anyhow::Result<()> {
        self.state.lock().await.cards.insert(deck_id, cards.to_vec());
        Ok(())
    }

    async fn replace_commanders(
        &self,
        deck_id: i64,
        commanders: &[CommanderRef],
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .commanders
            .insert(deck_id, commanders.to_vec());
        Ok(())
    }

    async fn log_unmapped_card(&self, name: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state
            .unmapped
            .entry(name.to_string())
            .and_modify(|record| {
                record.frequency += 1;
                record.last_seen = now;
            })
            .or_insert_with(|| UnmappedCardRecord {
                name: name.to_string(),
                frequency: 1,
                first_seen: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn log_job_run(&self, run: &JobRun) -> anyhow::Result<()> {
        self.state.lock().await.job_runs.push(run.clone());
        Ok(())
    }

    async fn pending_cards(
        &self,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> anyhow::Result<Vec<PendingCard>> {
        let state = self.state.lock().await;
        let mut pending = state
            .cards
            .iter()
            .flat_map(|(deck_id, cards)| {
                cards
                    .iter()
                    .filter(|card| card.canonical_id.is_none())
                    .map(|card| PendingCard {
                        deck_id: *deck_id,
                        name: card.name.clone(),
                        quantity: card.quantity,
                        zone: card.zone,
                    })
            })
            .filter(|card| match after {
                Some((deck_id, name)) => (card.deck_id, card.name.as_str()) > (deck_id, name),
                None => true,
            })
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| (a.deck_id, &a.name).cmp(&(b.deck_id, &b.name)));
        pending.dedup_by(|a, b| a.deck_id == b.deck_id && a.name == b.name);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn set_card_canonical_id(
        &self,
        deck_id: i64,
        name: &str,
        canonical_id: &str,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let mut updated = 0u64;
        if let Some(cards) = state.cards.get_mut(&deck_id) {
            for card in cards.iter_mut().filter(|c| c.name == name) {
                if card.enrich(Some(canonical_id.to_string())) {
                    updated += 1;
                }
            }
        }
        if let Some(commanders) = state.commanders.get_mut(&deck_id) {
            for commander in commanders
                .iter_mut()
                .filter(|c| c.name == name && c.canonical_id.is_none())
            {
                commander.canonical_id = Some(canonical_id.to_string());
            }
        }
        Ok(updated)
    }

    async fn recent_job_runs(&self, limit: usize) -> anyhow::Result<Vec<JobRun>> {
        let state = self.state.lock().await;
        Ok(state.job_runs.iter().rev().take(limit).cloned().collect())
    }

    async fn unmapped_cards(&self, limit: usize) -> anyhow::Result<Vec<UnmappedCardRecord>> {
        let state = self.state.lock().await;
        let mut records = state.unmapped.values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.name.cmp(&b.name)));
        records.truncate(limit);
        Ok(records)
    }

    async fn unmapped_seen_since(&self, since: DateTime<Utc>) -> anyhow::Result<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .unmapped
            .values()
            .filter(|record| record.last_seen >= since)
            .map(|record| record.name.clone())
            .collect())
    }

    async fn stats(&self) -> anyhow::Result<StoreStats> {
        let state = self.state.lock().await;
        let all_cards = state.cards.values().flatten();
        let (total, normalized) = all_cards.fold((0u64, 0u64), |(t, n), card| {
            (t + 1, n + u64::from(card.canonical_id.is_some()))
        });
        Ok(StoreStats {
            total_decks: state.decks.len() as u64,
            total_cards: total,
            normalized_cards: normalized,
            unmapped_unique_names: state.unmapped.len() as u64,
        })
    }
}
