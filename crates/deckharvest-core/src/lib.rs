//! Core domain model for deck harvesting: normalized decks, reference cards and job outcomes.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "deckharvest-core";

/// Inclusive card-count range a Commander deck is expected to fall in.
pub const COMMANDER_CARD_RANGE: std::ops::RangeInclusive<u32> = 80..=120;

/// Opaque per-source deck key (numeric id or slug). Unique only within its source.
pub type DeckIdentifier = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Main,
    Command,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Main => "main",
            Zone::Command => "command",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEntry {
    pub name: String,
    pub quantity: u32,
    pub zone: Zone,
    pub canonical_id: Option<String>,
}

impl CardEntry {
    pub fn new(name: impl Into<String>, quantity: u32, zone: Zone) -> Self {
        Self {
            name: name.into(),
            quantity: quantity.max(1),
            zone,
            canonical_id: None,
        }
    }

    pub fn with_canonical_id(mut self, canonical_id: Option<String>) -> Self {
        self.canonical_id = canonical_id.filter(|id| !id.is_empty());
        self
    }

    /// Fill in the canonical id if none is present yet. A resolved id is never replaced.
    pub fn enrich(&mut self, canonical_id: Option<String>) -> bool {
        if self.canonical_id.is_some() {
            return false;
        }
        match canonical_id {
            Some(id) => {
                self.canonical_id = Some(id);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommanderRef {
    pub name: String,
    pub canonical_id: Option<String>,
}

impl From<&CardEntry> for CommanderRef {
    fn from(card: &CardEntry) -> Self {
        Self {
            name: card.name.clone(),
            canonical_id: card.canonical_id.clone(),
        }
    }
}

/// One deck as produced by a source adapter from a single raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDeck {
    pub source_deck_id: DeckIdentifier,
    pub title: String,
    pub author: String,
    pub url: String,
    pub format: String,
    pub cards: Vec<CardEntry>,
    pub extra: Map<String, JsonValue>,
}

impl NormalizedDeck {
    /// Derived view over the command-zone entries of `cards`.
    pub fn commanders(&self) -> Vec<CommanderRef> {
        self.cards
            .iter()
            .filter(|c| c.zone == Zone::Command)
            .map(CommanderRef::from)
            .collect()
    }

    pub fn total_quantity(&self) -> u32 {
        self.cards.iter().map(|c| c.quantity).sum()
    }

    pub fn zone_quantity(&self, zone: Zone) -> u32 {
        self.cards
            .iter()
            .filter(|c| c.zone == zone)
            .map(|c| c.quantity)
            .sum()
    }

    pub fn unresolved_names(&self) -> BTreeSet<String> {
        self.cards
            .iter()
            .filter(|c| c.canonical_id.is_none())
            .map(|c| c.name.clone())
            .collect()
    }
}

/// One row of the bulk reference dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCard {
    pub canonical_id: String,
    pub primary_name: String,
    #[serde(default)]
    pub alternate_names: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Partial,
    Error,
    Skipped,
}

impl JobStatus {
    /// Status of a job that ran to completion over its units of work.
    pub fn from_counts(processed: u64, errors: u64) -> Self {
        match (processed, errors) {
            (_, 0) => JobStatus::Success,
            (0, _) => JobStatus::Error,
            _ => JobStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Error => "error",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(JobStatus::Success),
            "partial" => Some(JobStatus::Partial),
            "error" => Some(JobStatus::Error),
            "skipped" => Some(JobStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only outcome record, one per orchestrated job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: Uuid,
    pub source_name: String,
    pub operation: String,
    pub status: JobStatus,
    pub decks_processed: u64,
    pub cards_processed: u64,
    pub errors_count: u64,
    pub http_429_count: u64,
    pub duration: Duration,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmappedCardRecord {
    pub name: String,
    pub frequency: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A persisted card row still lacking a canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCard {
    pub deck_id: i64,
    pub name: String,
    pub quantity: u32,
    pub zone: Zone,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_decks: u64,
    pub total_cards: u64,
    pub normalized_cards: u64,
    pub unmapped_unique_names: u64,
}

impl StoreStats {
    pub fn normalization_percentage(&self) -> f64 {
        if self.total_cards == 0 {
            0.0
        } else {
            self.normalized_cards as f64 / self.total_cards as f64 * 100.0
        }
    }
}
