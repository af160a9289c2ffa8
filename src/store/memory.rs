use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{sort_by_source_order, IngestionSource, Keyed, StageStore, WatermarkStore};
use crate::error::{SourceError, StoreError};
use crate::models::RawRecord;

/// In-process stage store keyed by `call_id`
#[derive(Debug)]
pub struct MemoryStore<R> {
    records: RwLock<BTreeMap<String, R>>,
}

impl<R: Clone> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshot of every stored row, ordered by key
    pub async fn records(&self) -> Vec<R> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl<R: Clone> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> StageStore<R> for MemoryStore<R>
where
    R: Keyed + Clone + Send + Sync + 'static,
{
    async fn get(&self, call_id: &str) -> Result<Option<R>, StoreError> {
        Ok(self.records.read().await.get(call_id).cloned())
    }

    async fn upsert(&self, record: R) -> Result<(), StoreError> {
        let key = record.key().to_string();
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn exists(&self, call_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(call_id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process watermark
#[derive(Debug, Default)]
pub struct MemoryWatermark {
    value: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryWatermark {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermark {
    async fn read_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.value.read().await)
    }

    async fn write_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        *self.value.write().await = Some(watermark);
        Ok(())
    }
}

/// Fixed set of raw records served as an ingestion source
#[derive(Debug, Default)]
pub struct MemorySource {
    records: RwLock<Vec<RawRecord>>,
}

impl MemorySource {
    pub fn new(mut records: Vec<RawRecord>) -> Self {
        sort_by_source_order(&mut records);
        Self {
            records: RwLock::new(records),
        }
    }

    /// Make another record available, as data acquisition would
    pub async fn push(&self, record: RawRecord) {
        let mut records = self.records.write().await;
        records.push(record);
        sort_by_source_order(&mut records);
    }
}

#[async_trait]
impl IngestionSource for MemorySource {
    async fn list_available(&self, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        Ok(self.records.read().await.iter().take(limit).cloned().collect())
    }

    async fn fetch(&self, call_id: &str) -> Result<RawRecord, SourceError> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.call_id == call_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(call_id.to_string()))
    }

    async fn list_since(
        &self,
        marker: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| marker.is_none_or(|marker| r.timestamp > marker))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(call_id: &str, hour: u32) -> RawRecord {
        RawRecord {
            call_id: call_id.to_string(),
            agent_name: "Agent".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            transcript_text: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let store: MemoryStore<RawRecord> = MemoryStore::new();
        store.upsert(raw("CALL_1", 1)).await.unwrap();
        store.upsert(raw("CALL_1", 2)).await.unwrap();

        assert_eq!(store.len().await, 1);
        let stored = store.get("CALL_1").await.unwrap().unwrap();
        assert_eq!(stored.timestamp.format("%H").to_string(), "02");
        assert!(store.exists("CALL_1").await.unwrap());
        assert!(!store.exists("CALL_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_source_orders_and_filters() {
        let source = MemorySource::new(vec![raw("B", 3), raw("A", 1), raw("C", 2)]);

        let ids: Vec<_> = source
            .list_available(10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(ids, vec!["A", "C", "B"]);

        let marker = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let since = source.list_since(Some(marker), 10).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].call_id, "B");

        assert!(matches!(source.fetch("Z").await, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_source_limit_applies_after_marker() {
        let source = MemorySource::new(vec![raw("A", 1), raw("B", 2), raw("C", 3), raw("D", 4)]);
        let marker = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

        let ids: Vec<_> = source
            .list_since(Some(marker), 1)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        assert_eq!(ids, vec!["C"]);
    }

    #[tokio::test]
    async fn test_watermark_roundtrip() {
        let watermark = MemoryWatermark::new();
        assert_eq!(watermark.read_watermark().await.unwrap(), None);
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        watermark.write_watermark(ts).await.unwrap();
        assert_eq!(watermark.read_watermark().await.unwrap(), Some(ts));
    }
}
