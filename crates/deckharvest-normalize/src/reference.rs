//! Scryfall oracle-cards bulk dataset: metadata check, conditional download, parse.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckharvest_core::ReferenceCard;
use deckharvest_storage::RequestEngine;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{DatasetFreshness, NormalizeError, ReferenceSource};

pub const DEFAULT_BULK_URL: &str = "https://api.scryfall.com/bulk-data/oracle-cards";
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkMetadata {
    pub download_uri: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawBulkMetadata {
    download_uri: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetStatus {
    UpToDate,
    Downloaded { bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct ScryfallBulkSource {
    engine: Arc<RequestEngine>,
    metadata_url: String,
    local_path: PathBuf,
}

impl ScryfallBulkSource {
    pub fn new(
        engine: Arc<RequestEngine>,
        metadata_url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            metadata_url: metadata_url.into(),
            local_path: local_path.into(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub async fn fetch_metadata(&self) -> Result<BulkMetadata, NormalizeError> {
        let raw: RawBulkMetadata = self.engine.get(&self.metadata_url, &[], None).await?.json()?;
        let download_uri = raw
            .download_uri
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NormalizeError::Metadata("missing download_uri".into()))?;
        let updated_at = raw
            .updated_at
            .ok_or_else(|| NormalizeError::Metadata("missing updated_at".into()))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| NormalizeError::Metadata(format!("updated_at {updated_at:?}: {e}")))?
            .with_timezone(&Utc);
        Ok(BulkMetadata {
            download_uri,
            updated_at,
        })
    }

    async fn local_modified(&self) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::metadata(&self.local_path).await.ok()?;
        let modified: SystemTime = meta.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    /// Download the dataset unless the local copy is at least as new as the remote one.
    pub async fn ensure_local_dataset(&self) -> Result<DatasetStatus, NormalizeError> {
        let metadata = self.fetch_metadata().await?;
        if let Some(local) = self.local_modified().await {
            if local >= metadata.updated_at {
                info!(path = %self.local_path.display(), "reference dataset is up to date");
                return Ok(DatasetStatus::UpToDate);
            }
        }

        info!(url = %metadata.download_uri, "downloading reference dataset");
        let bytes = self
            .engine
            .download_to_file(&metadata.download_uri, Some(DOWNLOAD_TIMEOUT), &self.local_path)
            .await?;
        info!(bytes, path = %self.local_path.display(), "reference dataset saved");
        Ok(DatasetStatus::Downloaded { bytes })
    }

    async fn local_is_younger_than(&self, max_age: Duration) -> bool {
        match self.local_modified().await {
            Some(modified) => Utc::now()
                .signed_duration_since(modified)
                .to_std()
                .map(|age| age < max_age)
                .unwrap_or(true),
            None => false,
        }
    }
}

#[async_trait]
impl ReferenceSource for ScryfallBulkSource {
    async fn load(
        &self,
        freshness: DatasetFreshness,
    ) -> Result<Vec<ReferenceCard>, NormalizeError> {
        let trust_local = match freshness {
            DatasetFreshness::AcceptLocalYoungerThan(max_age) => {
                self.local_is_younger_than(max_age).await
            }
            DatasetFreshness::CheckRemote => false,
        };
        if !trust_local {
            self.ensure_local_dataset().await?;
        }

        let path = self.local_path.clone();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| NormalizeError::Io { path, source })?;
        tokio::task::spawn_blocking(move || parse_dataset(&bytes))
            .await
            .map_err(|e| NormalizeError::Dataset(format!("dataset parse task failed: {e}")))?
    }
}

/// Parse the oracle-cards JSON array; rows without an oracle id are skipped.
pub fn parse_dataset(bytes: &[u8]) -> Result<Vec<ReferenceCard>, NormalizeError> {
    let rows: Vec<JsonValue> = serde_json::from_slice(bytes)?;
    let mut skipped = 0usize;
    let mut cards = Vec::with_capacity(rows.len());

    for row in &rows {
        let (Some(oracle_id), Some(name)) = (
            row.get("oracle_id").and_then(|v| v.as_str()),
            row.get("name").and_then(|v| v.as_str()),
        ) else {
            skipped += 1;
            continue;
        };

        let mut alternate_names = row
            .get("card_faces")
            .and_then(|f| f.as_array())
            .map(|faces| {
                faces
                    .iter()
                    .filter_map(|face| face.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();
        if let Some(printed) = row.get("printed_name").and_then(|v| v.as_str()) {
            if !printed.is_empty() {
                alternate_names.insert(printed.to_string());
            }
        }

        cards.push(ReferenceCard {
            canonical_id: oracle_id.to_string(),
            primary_name: name.to_string(),
            alternate_names,
        });
    }

    if skipped > 0 {
        warn!(skipped, "reference rows without oracle_id or name were skipped");
    }
    Ok(cards)
}
