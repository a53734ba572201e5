//! Ingestion orchestrator: named jobs, per-unit failure isolation, one `JobRun` per run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use deckharvest_adapters::{DiscoveryOptions, SourceAdapter};
use deckharvest_core::{DeckIdentifier, JobRun, JobStatus, NormalizedDeck, StoreStats};
use deckharvest_normalize::CardNormalizer;
use deckharvest_storage::{DeckStore, RequestEngine};
use futures::stream::{self, StreamExt};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::monitor::HarvestMetrics;
use crate::{JobKind, SourceSettings};

/// Incremental ingestion never walks more bulk pages than this.
pub const MAX_INCREMENTAL_PAGES: u32 = 10;
/// Pending rows read per store round trip during the normalization sweep.
pub const DEFAULT_SWEEP_BATCH: usize = 5000;
/// Export cap used by a one-shot pass over every job.
pub const RUN_ONCE_EXPORT_CAP: usize = 50;

/// A configured source: its adapter, the engine behind it, and its registry entry.
#[derive(Clone)]
pub struct SourceHandle {
    pub adapter: Arc<dyn SourceAdapter>,
    /// Read for the per-job throttling delta; `None` reports zero.
    pub engine: Option<Arc<RequestEngine>>,
    pub settings: SourceSettings,
}

impl SourceHandle {
    fn throttled_count(&self) -> u64 {
        self.engine.as_ref().map(|e| e.throttled_count()).unwrap_or(0)
    }

    fn discovery_options(&self) -> DiscoveryOptions {
        let discovery = &self.settings.discovery;
        DiscoveryOptions {
            commanders: discovery.popular_commanders.clone(),
            max_pages: discovery.max_pages,
            politeness: Duration::from_secs_f64(discovery.politeness_secs.max(0.0)),
            max_ids: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub normalize_on_ingest: bool,
    pub export_concurrency: usize,
    pub sweep_batch: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            normalize_on_ingest: true,
            export_concurrency: 4,
            sweep_batch: DEFAULT_SWEEP_BATCH,
        }
    }
}

#[derive(Debug, Default)]
struct JobCounters {
    decks: u64,
    cards: u64,
    errors: u64,
    message: Option<String>,
}

impl JobCounters {
    fn record_deck(&mut self, outcome: Result<u64>, deck_id: &str) {
        match outcome {
            Ok(cards) => {
                self.decks += 1;
                self.cards += cards;
            }
            Err(err) => {
                warn!(deck_id, error = format!("{err:#}"), "deck failed");
                self.errors += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct ExportRequest {
    ids: Vec<DeckIdentifier>,
    max_decks: Option<usize>,
}

pub struct IngestionJobs {
    store: Arc<dyn DeckStore>,
    normalizer: Arc<CardNormalizer>,
    sources: Vec<SourceHandle>,
    options: JobOptions,
    metrics: Arc<HarvestMetrics>,
}

impl IngestionJobs {
    pub fn new(
        store: Arc<dyn DeckStore>,
        normalizer: Arc<CardNormalizer>,
        sources: Vec<SourceHandle>,
        options: JobOptions,
    ) -> Self {
        Self {
            store,
            normalizer,
            sources,
            options,
            metrics: Arc::new(HarvestMetrics::new()),
        }
    }

    /// Counters and timers for runs made by this process.
    pub fn metrics(&self) -> &Arc<HarvestMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn DeckStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Arc<CardNormalizer> {
        &self.normalizer
    }

    pub fn source(&self, name: &str) -> Option<&SourceHandle> {
        self.sources.iter().find(|h| h.settings.name == name)
    }

    /// Run one job to completion and record its outcome.
    ///
    /// Unit failures become counters on the returned run. `Err` only means the run
    /// itself could not be recorded.
    pub async fn run(&self, kind: JobKind) -> Result<JobRun> {
        self.run_with(kind, ExportRequest::default()).await
    }

    /// Export the given ids (or freshly discovered ones when empty), capped at `max_decks`.
    pub async fn run_export(&self, ids: Vec<DeckIdentifier>, max_decks: usize) -> Result<JobRun> {
        self.run_with(
            JobKind::MoxfieldExport,
            ExportRequest {
                ids,
                max_decks: Some(max_decks),
            },
        )
        .await
    }

    /// Every job once, in schedule order.
    pub async fn run_all(&self, export_cap: usize) -> Result<Vec<JobRun>> {
        let mut runs = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            let run = match kind {
                JobKind::MoxfieldExport => self.run_export(Vec::new(), export_cap).await?,
                _ => self.run(kind).await?,
            };
            runs.push(run);
        }
        Ok(runs)
    }

    async fn run_with(&self, kind: JobKind, export: ExportRequest) -> Result<JobRun> {
        let run_id = Uuid::new_v4();
        let span = info_span!("job", %run_id, job = %kind);
        self.run_logged(run_id, kind, export).instrument(span).await
    }

    async fn run_logged(
        &self,
        run_id: Uuid,
        kind: JobKind,
        export: ExportRequest,
    ) -> Result<JobRun> {
        let timestamp = Utc::now();
        let started = Instant::now();
        info!("job started");

        let handle = match kind {
            JobKind::Normalization => None,
            _ => self.source(kind.source_name()),
        };
        let throttled_before = handle.map(SourceHandle::throttled_count).unwrap_or(0);

        let outcome = match (kind, handle) {
            (_, Some(h)) if !h.settings.enabled => Ok(None),
            (JobKind::Normalization, _) => self.run_normalization().await.map(Some),
            (_, None) => Err(anyhow::anyhow!("source {} is not configured", kind.source_name())),
            (JobKind::ArchidektIncremental, Some(h)) => self.run_incremental(h).await.map(Some),
            (JobKind::MoxfieldDiscovery, Some(h)) => self.run_discovery(h).await.map(Some),
            (JobKind::MoxfieldExport, Some(h)) => self.run_export_job(h, export).await.map(Some),
        };

        if let Some(fallback) = handle.and_then(|h| h.adapter.as_browser_fallback()) {
            fallback.release_browser().await;
        }

        let (status, counters) = match outcome {
            Ok(Some(counters)) => (
                JobStatus::from_counts(counters.decks + counters.cards, counters.errors),
                counters,
            ),
            Ok(None) => (
                JobStatus::Skipped,
                JobCounters {
                    message: Some(format!("source {} is disabled", kind.source_name())),
                    ..JobCounters::default()
                },
            ),
            Err(err) => {
                warn!(error = format!("{err:#}"), "job failed");
                (
                    JobStatus::Error,
                    JobCounters {
                        message: Some(format!("{err:#}")),
                        ..JobCounters::default()
                    },
                )
            }
        };

        let throttled_after = handle.map(SourceHandle::throttled_count).unwrap_or(0);
        let run = JobRun {
            run_id,
            source_name: kind.source_name().to_string(),
            operation: kind.operation().to_string(),
            status,
            decks_processed: counters.decks,
            cards_processed: counters.cards,
            errors_count: counters.errors,
            http_429_count: throttled_after.saturating_sub(throttled_before),
            duration: started.elapsed(),
            message: counters.message,
            timestamp,
        };
        info!(
            status = %run.status,
            decks = run.decks_processed,
            cards = run.cards_processed,
            errors = run.errors_count,
            throttled = run.http_429_count,
            "job finished"
        );
        self.metrics.record_run(&run);
        self.store
            .log_job_run(&run)
            .await
            .context("recording job run")?;
        Ok(run)
    }

    async fn prepare_normalizer(&self) -> Result<()> {
        if self.options.normalize_on_ingest {
            self.normalizer
                .ensure_ready()
                .await
                .context("preparing card normalizer")?;
        }
        Ok(())
    }

    async fn run_incremental(&self, handle: &SourceHandle) -> Result<JobCounters> {
        let source_name = handle.adapter.source_name();
        let bulk = handle
            .adapter
            .as_bulk()
            .with_context(|| format!("{source_name} does not support bulk listing"))?;
        self.prepare_normalizer().await?;

        let mut counters = JobCounters::default();
        let pages = handle.settings.max_pages.min(MAX_INCREMENTAL_PAGES);
        for page in 1..=pages {
            let listing = match bulk.fetch_bulk(page, handle.settings.page_size).await {
                Ok(listing) => listing,
                Err(err) => {
                    warn!(page, error = %err, "bulk page failed");
                    counters.errors += 1;
                    continue;
                }
            };
            if listing.is_exhausted() {
                info!(page, "no more decks");
                break;
            }
            counters.errors += listing.malformed;
            for deck in listing.decks {
                let deck_id = deck.source_deck_id.clone();
                let outcome = self.persist_deck(source_name, deck).await;
                counters.record_deck(outcome, &deck_id);
            }
        }
        Ok(counters)
    }

    async fn discover_ids(&self, handle: &SourceHandle) -> Result<Vec<DeckIdentifier>> {
        let source_name = handle.adapter.source_name();
        let discoverable = handle
            .adapter
            .as_discoverable()
            .with_context(|| format!("{source_name} does not support discovery"))?;
        discoverable
            .discover(&handle.discovery_options())
            .await
            .with_context(|| format!("discovering {source_name} deck ids"))
    }

    async fn run_discovery(&self, handle: &SourceHandle) -> Result<JobCounters> {
        let ids = self.discover_ids(handle).await?;
        Ok(JobCounters {
            decks: ids.len() as u64,
            message: Some(format!("discovered {} deck ids", ids.len())),
            ..JobCounters::default()
        })
    }

    async fn run_export_job(
        &self,
        handle: &SourceHandle,
        request: ExportRequest,
    ) -> Result<JobCounters> {
        let max_decks = request
            .max_decks
            .unwrap_or(handle.settings.export.max_decks);
        let mut ids = if request.ids.is_empty() {
            info!("no deck ids given, running discovery first");
            self.discover_ids(handle).await?
        } else {
            request.ids
        };
        ids.truncate(max_decks);
        self.prepare_normalizer().await?;

        let adapter = handle.adapter.as_ref();
        let source_name = adapter.source_name();
        let outcomes = stream::iter(ids)
            .map(|id| async move {
                let outcome = match adapter.fetch_one(&id).await {
                    Ok(Some(deck)) => self.persist_deck(source_name, deck).await,
                    Ok(None) => Err(anyhow::anyhow!("deck {id} was not found")),
                    Err(err) => Err(anyhow::Error::new(err).context(format!("fetching deck {id}"))),
                };
                (id, outcome)
            })
            .buffer_unordered(self.options.export_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut counters = JobCounters::default();
        for (id, outcome) in outcomes {
            counters.record_deck(outcome, &id);
        }
        Ok(counters)
    }

    /// Walk every pending `(deck, name)` pair in key order, one batch at a time.
    ///
    /// Misses are logged once per reference build: names already logged since the
    /// index was built are not counted again.
    async fn run_normalization(&self) -> Result<JobCounters> {
        self.normalizer
            .ensure_ready()
            .await
            .context("preparing card normalizer")?;
        let mut already_logged = match self.normalizer.stats().await.built_at {
            Some(built_at) => self
                .store
                .unmapped_seen_since(built_at)
                .await
                .context("reading recently logged unmapped names")?,
            None => HashSet::new(),
        };

        let batch = self.options.sweep_batch.max(1);
        let mut counters = JobCounters::default();
        let mut rows = 0usize;
        let mut names = HashSet::new();
        let mut unmapped = HashSet::new();
        let mut cursor: Option<(i64, String)> = None;
        loop {
            let after = cursor.as_ref().map(|(deck_id, name)| (*deck_id, name.as_str()));
            let pending = self
                .store
                .pending_cards(after, batch)
                .await
                .context("reading cards without canonical ids")?;
            let Some(last) = pending.last() else {
                break;
            };
            cursor = Some((last.deck_id, last.name.clone()));
            rows += pending.len();

            let resolved = self
                .normalizer
                .resolve_batch(pending.iter().map(|card| card.name.as_str()))
                .await
                .context("resolving pending card names")?;
            for (name, canonical_id) in &resolved {
                names.insert(name.clone());
                if canonical_id.is_some() {
                    continue;
                }
                unmapped.insert(name.clone());
                if !already_logged.insert(name.clone()) {
                    continue;
                }
                if let Err(err) = self.store.log_unmapped_card(name).await {
                    warn!(card = %name, error = format!("{err:#}"), "failed to log unmapped card");
                    counters.errors += 1;
                }
            }
            for card in &pending {
                let Some(Some(canonical_id)) = resolved.get(&card.name) else {
                    continue;
                };
                match self
                    .store
                    .set_card_canonical_id(card.deck_id, &card.name, canonical_id)
                    .await
                {
                    Ok(updated) => counters.cards += updated,
                    Err(err) => {
                        warn!(
                            deck = card.deck_id,
                            card = %card.name,
                            error = format!("{err:#}"),
                            "card update failed"
                        );
                        counters.errors += 1;
                    }
                }
            }

            if pending.len() < batch {
                break;
            }
        }

        counters.message = Some(if rows == 0 {
            "no pending cards".to_string()
        } else {
            format!(
                "{rows} pending rows, {} distinct names, {} unmapped",
                names.len(),
                unmapped.len()
            )
        });
        Ok(counters)
    }

    /// Fill missing canonical ids in place; misses are logged as unmapped, not failed.
    pub async fn enrich_deck(&self, deck: &mut NormalizedDeck) -> Result<()> {
        let names = deck.unresolved_names();
        if names.is_empty() {
            return Ok(());
        }
        let resolved = self.normalizer.resolve_batch(&names).await?;
        for card in deck.cards.iter_mut() {
            if let Some(Some(canonical_id)) = resolved.get(&card.name) {
                card.enrich(Some(canonical_id.clone()));
            }
        }
        for (name, canonical_id) in &resolved {
            if canonical_id.is_none() {
                self.store.log_unmapped_card(name).await?;
            }
        }
        Ok(())
    }

    /// Upsert the deck and replace its card and commander rows. Returns the card count.
    pub async fn persist_deck(&self, source_name: &str, mut deck: NormalizedDeck) -> Result<u64> {
        if self.options.normalize_on_ingest {
            self.enrich_deck(&mut deck)
                .await
                .with_context(|| format!("enriching deck {}", deck.source_deck_id))?;
        }
        let deck_id = self.store.upsert_deck(source_name, &deck).await?;
        self.store.replace_cards(deck_id, &deck.cards).await?;
        self.store
            .replace_commanders(deck_id, &deck.commanders())
            .await?;
        Ok(deck.cards.len() as u64)
    }

    pub async fn recent_job_runs(&self, limit: usize) -> Result<Vec<JobRun>> {
        self.store.recent_job_runs(limit).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Release every browser session held by a source adapter.
    pub async fn release_browsers(&self) {
        for handle in &self.sources {
            if let Some(fallback) = handle.adapter.as_browser_fallback() {
                fallback.release_browser().await;
            }
        }
    }
}
