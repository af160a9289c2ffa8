pub mod file;
pub mod memory;

pub use file::*;
pub use memory::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SourceError, StoreError};
use crate::models::{CleanedRecord, MetricsRecord, RawRecord};

/// Records addressable by their `call_id`
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for RawRecord {
    fn key(&self) -> &str {
        &self.call_id
    }
}

impl Keyed for CleanedRecord {
    fn key(&self) -> &str {
        &self.call_id
    }
}

impl Keyed for MetricsRecord {
    fn key(&self) -> &str {
        &self.call_id
    }
}

/// Keyed storage for one refinement stage.
///
/// `upsert` fully replaces any row with the same key and must be atomic per
/// key: readers see either the old or the new row, never a mix.
#[async_trait]
pub trait StageStore<R>: Send + Sync
where
    R: Send + Sync + 'static,
{
    async fn get(&self, call_id: &str) -> Result<Option<R>, StoreError>;

    async fn upsert(&self, record: R) -> Result<(), StoreError>;

    async fn exists(&self, call_id: &str) -> Result<bool, StoreError>;

    /// Cheap reachability probe used before a run starts
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Persisted incremental-processing watermark
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn read_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn write_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Pull interface onto data acquisition
#[async_trait]
pub trait IngestionSource: Send + Sync {
    /// Up to `limit` records, ordered by `(timestamp, call_id)`
    async fn list_available(&self, limit: usize) -> Result<Vec<RawRecord>, SourceError>;

    async fn fetch(&self, call_id: &str) -> Result<RawRecord, SourceError>;

    /// Up to `limit` records whose timestamp is strictly after `marker`, in
    /// source order. The marker filter applies before the limit.
    async fn list_since(
        &self,
        marker: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let Some(marker) = marker else {
            return self.list_available(limit).await;
        };
        let mut records = self.list_available(usize::MAX).await?;
        retain_after(&mut records, marker, limit);
        Ok(records)
    }
}

/// The three stage stores plus the watermark, as handed to the engine
#[derive(Clone)]
pub struct Stores {
    pub raw: Arc<dyn StageStore<RawRecord>>,
    pub cleaned: Arc<dyn StageStore<CleanedRecord>>,
    pub metrics: Arc<dyn StageStore<MetricsRecord>>,
    pub watermark: Arc<dyn WatermarkStore>,
}

/// Bound a store call; an elapsed timer surfaces as a transient `Timeout`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Keep source-ordered records strictly after `marker`, then cap at `limit`
pub(crate) fn retain_after(records: &mut Vec<RawRecord>, marker: DateTime<Utc>, limit: usize) {
    records.retain(|r| r.timestamp > marker);
    records.truncate(limit);
}

/// Sort records into source order
pub(crate) fn sort_by_source_order(records: &mut [RawRecord]) {
    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.call_id.cmp(&b.call_id))
    });
}
