use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckharvest_core::{
    CardEntry, CommanderRef, JobRun, JobStatus, NormalizedDeck, PendingCard, StoreStats,
    UnmappedCardRecord, Zone,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::DeckStore;

/// Postgres-backed deck store.
#[derive(Debug, Clone)]
pub struct PgDeckStore {
    pool: PgPool,
}

impl PgDeckStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .with_context(|| "failed to connect to DATABASE_URL")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("failed to apply migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

fn parse_zone(value: &str) -> Zone {
    match value {
        "command" => Zone::Command,
        _ => Zone::Main,
    }
}

#[async_trait]
impl DeckStore for PgDeckStore {
    async fn upsert_deck(&self, source_name: &str, deck: &NormalizedDeck) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO decks (
                source_name, source_deck_id, format, title, author, url, extra,
                created_at, updated_at, last_seen_at, fetched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW(), NOW(), NOW())
            ON CONFLICT (source_name, source_deck_id) DO UPDATE
               SET format = EXCLUDED.format,
                   title = EXCLUDED.title,
                   author = EXCLUDED.author,
                   url = EXCLUDED.url,
                   extra = EXCLUDED.extra,
                   updated_at = NOW(),
                   last_seen_at = NOW(),
                   fetched_at = NOW()
            RETURNING id
            "#,
        )
        .bind(source_name)
        .bind(&deck.source_deck_id)
        .bind(&deck.format)
        .bind(&deck.title)
        .bind(&deck.author)
        .bind(&deck.url)
        .bind(serde_json::Value::Object(deck.extra.clone()))
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!("failed to upsert deck {source_name}/{}", deck.source_deck_id)
        })?;
        Ok(row.try_get("id")?)
    }

    async fn replace_cards(&self, deck_id: i64, cards: &[CardEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deck_cards WHERE deck_id = $1")
            .bind(deck_id)
            .execute(&mut *tx)
            .await?;
        for card in cards {
            sqlx::query(
                r#"
                INSERT INTO deck_cards (deck_id, name, quantity, zone, oracle_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(deck_id)
            .bind(&card.name)
            .bind(card.quantity as i32)
            .bind(card.zone.as_str())
            .bind(card.canonical_id.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_commanders(
        &self,
        deck_id: i64,
        commanders: &[CommanderRef],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deck_commanders WHERE deck_id = $1")
            .bind(deck_id)
            .execute(&mut *tx)
            .await?;
        for commander in commanders {
            sqlx::query(
                "INSERT INTO deck_commanders (deck_id, name, oracle_id) VALUES ($1, $2, $3)",
            )
            .bind(deck_id)
            .bind(&commander.name)
            .bind(commander.canonical_id.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn log_unmapped_card(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO unmapped_cards (name, frequency, first_seen, last_seen)
            VALUES ($1, 1, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE
               SET frequency = unmapped_cards.frequency + 1,
                   last_seen = NOW()
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_job_run(&self, run: &JobRun) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_logs (
                run_id, source_name, operation, status, decks_processed, cards_processed,
                errors_count, http_429_count, duration_ms, message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.source_name)
        .bind(&run.operation)
        .bind(run.status.as_str())
        .bind(run.decks_processed as i64)
        .bind(run.cards_processed as i64)
        .bind(run.errors_count as i64)
        .bind(run.http_429_count as i64)
        .bind(run.duration.as_millis() as i64)
        .bind(run.message.as_deref())
        .bind(run.timestamp)
        .execute(&self.pool)
        .await
        .context("failed to write ingestion log")?;
        Ok(())
    }

    async fn pending_cards(
        &self,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> anyhow::Result<Vec<PendingCard>> {
        let rows = sqlx::query(
            r#"
            SELECT deck_id, name, MIN(quantity) AS quantity, MIN(zone) AS zone
              FROM deck_cards
             WHERE oracle_id IS NULL
               AND ($1::BIGINT IS NULL OR (deck_id, name) > ($1::BIGINT, $2::TEXT))
             GROUP BY deck_id, name
             ORDER BY deck_id, name
             LIMIT $3
            "#,
        )
        .bind(after.map(|(deck_id, _)| deck_id))
        .bind(after.map(|(_, name)| name))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let quantity: i32 = row.try_get("quantity")?;
            let zone: String = row.try_get("zone")?;
            out.push(PendingCard {
                deck_id: row.try_get("deck_id")?,
                name: row.try_get("name")?,
                quantity: quantity.max(1) as u32,
                zone: parse_zone(&zone),
            });
        }
        Ok(out)
    }

    async fn set_card_canonical_id(
        &self,
        deck_id: i64,
        name: &str,
        canonical_id: &str,
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let cards = sqlx::query(
            r#"
            UPDATE deck_cards
               SET oracle_id = $3
             WHERE deck_id = $1
               AND name = $2
               AND oracle_id IS NULL
            "#,
        )
        .bind(deck_id)
        .bind(name)
        .bind(canonical_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE deck_commanders
               SET oracle_id = $3
             WHERE deck_id = $1
               AND name = $2
               AND oracle_id IS NULL
            "#,
        )
        .bind(deck_id)
        .bind(name)
        .bind(canonical_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(cards.rows_affected())
    }

    async fn recent_job_runs(&self, limit: usize) -> anyhow::Result<Vec<JobRun>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, source_name, operation, status, decks_processed, cards_processed,
                   errors_count, http_429_count, duration_ms, message, created_at
              FROM ingestion_logs
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let decks: i64 = row.try_get("decks_processed")?;
            let cards: i64 = row.try_get("cards_processed")?;
            let errors: i64 = row.try_get("errors_count")?;
            let throttled: i64 = row.try_get("http_429_count")?;
            let duration_ms: i64 = row.try_get("duration_ms")?;
            let timestamp: DateTime<Utc> = row.try_get("created_at")?;
            out.push(JobRun {
                run_id: row.try_get("run_id")?,
                source_name: row.try_get("source_name")?,
                operation: row.try_get("operation")?,
                status: JobStatus::parse(&status)
                    .with_context(|| format!("unknown job status {status:?}"))?,
                decks_processed: decks.max(0) as u64,
                cards_processed: cards.max(0) as u64,
                errors_count: errors.max(0) as u64,
                http_429_count: throttled.max(0) as u64,
                duration: Duration::from_millis(duration_ms.max(0) as u64),
                message: row.try_get("message")?,
                timestamp,
            });
        }
        Ok(out)
    }

    async fn unmapped_cards(&self, limit: usize) -> anyhow::Result<Vec<UnmappedCardRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT name, frequency, first_seen, last_seen
              FROM unmapped_cards
             ORDER BY frequency DESC, name
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let frequency: i64 = row.try_get("frequency")?;
            out.push(UnmappedCardRecord {
                name: row.try_get("name")?,
                frequency: frequency.max(0) as u64,
                first_seen: row.try_get("first_seen")?,
                last_seen: row.try_get("last_seen")?,
            });
        }
        Ok(out)
    }

    async fn unmapped_seen_since(&self, since: DateTime<Utc>) -> anyhow::Result<HashSet<String>> {
        let rows = sqlx::query("SELECT name FROM unmapped_cards WHERE last_seen >= $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
            .collect()
    }

    async fn stats(&self) -> anyhow::Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM decks) AS total_decks,
                   (SELECT COUNT(*) FROM deck_cards) AS total_cards,
                   (SELECT COUNT(*) FROM deck_cards WHERE oracle_id IS NOT NULL)
                       AS normalized_cards,
                   (SELECT COUNT(*) FROM unmapped_cards) AS unmapped_unique_names
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> anyhow::Result<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };
        Ok(StoreStats {
            total_decks: count("total_decks")?,
            total_cards: count("total_cards")?,
            normalized_cards: count("normalized_cards")?,
            unmapped_unique_names: count("unmapped_unique_names")?,
        })
    }
}
