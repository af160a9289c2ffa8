use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{clean_record, extract_metrics, validate_call_id};
use crate::error::PipelineError;
use crate::models::{PromotionResult, RawRecord, RecordState, SkipReason, Stage};
use crate::rules::RuleSet;
use crate::store::{with_timeout, Stores};

/// Perform Stage 2: promotion into the stage stores
///
/// Each promotion derives the target-stage row from the stored predecessor
/// row and upserts it under `call_id`:
/// 1. Raw: store the ingested record (raw rows are never replaced)
/// 2. Cleaned: normalize the stored raw record
/// 3. Metrics: extract metrics from the stored cleaned record
///
/// A row whose derived content is unchanged is left alone, so repeated
/// promotion of the same input converges on one identical stored row.
#[derive(Clone)]
pub struct StagePromoter {
    stores: Stores,
    rules: Arc<RuleSet>,
    store_timeout: Duration,
}

impl StagePromoter {
    pub fn new(stores: Stores, rules: Arc<RuleSet>, store_timeout: Duration) -> Self {
        Self {
            stores,
            rules,
            store_timeout,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Promote the record identified by `record.call_id` into `target`
    pub async fn promote(
        &self,
        record: &RawRecord,
        target: Stage,
    ) -> Result<PromotionResult, PipelineError> {
        let result = match target {
            Stage::Raw => self.ingest(record).await?,
            Stage::Cleaned => self.promote_cleaned(&record.call_id).await?,
            Stage::Metrics => self.promote_metrics(&record.call_id).await?,
        };

        debug!(
            call_id = %record.call_id,
            stage = %target,
            written = result.written,
            "Promotion complete"
        );
        Ok(result)
    }

    /// Highest stage currently stored for `call_id`
    pub async fn state_of(&self, call_id: &str) -> Result<RecordState, PipelineError> {
        let limit = self.store_timeout;
        if with_timeout(limit, self.stores.metrics.exists(call_id)).await? {
            return Ok(RecordState::At(Stage::Metrics));
        }
        if with_timeout(limit, self.stores.cleaned.exists(call_id)).await? {
            return Ok(RecordState::At(Stage::Cleaned));
        }
        if with_timeout(limit, self.stores.raw.exists(call_id)).await? {
            return Ok(RecordState::At(Stage::Raw));
        }
        Ok(RecordState::Unseen)
    }

    async fn ingest(&self, record: &RawRecord) -> Result<PromotionResult, PipelineError> {
        validate_call_id(&record.call_id)?;

        let existing = with_timeout(self.store_timeout, self.stores.raw.get(&record.call_id)).await?;
        match existing {
            Some(stored) if stored == *record => Ok(PromotionResult::skipped(SkipReason::Unchanged)),
            Some(_) => {
                warn!(
                    call_id = %record.call_id,
                    "Raw record differs from the stored one; keeping the stored record"
                );
                Ok(PromotionResult::skipped(SkipReason::RawConflict))
            }
            None => {
                with_timeout(self.store_timeout, self.stores.raw.upsert(record.clone())).await?;
                Ok(PromotionResult::written())
            }
        }
    }

    async fn promote_cleaned(&self, call_id: &str) -> Result<PromotionResult, PipelineError> {
        let raw = with_timeout(self.store_timeout, self.stores.raw.get(call_id))
            .await?
            .ok_or_else(|| missing(call_id, Stage::Cleaned))?;

        let cleaned = clean_record(&raw, Utc::now())?;

        let existing = with_timeout(self.store_timeout, self.stores.cleaned.get(call_id)).await?;
        if existing.is_some_and(|stored| stored.same_content(&cleaned)) {
            return Ok(PromotionResult::skipped(SkipReason::Unchanged));
        }

        with_timeout(self.store_timeout, self.stores.cleaned.upsert(cleaned)).await?;
        Ok(PromotionResult::written())
    }

    async fn promote_metrics(&self, call_id: &str) -> Result<PromotionResult, PipelineError> {
        let cleaned = with_timeout(self.store_timeout, self.stores.cleaned.get(call_id))
            .await?
            .ok_or_else(|| missing(call_id, Stage::Metrics))?;

        let metrics = extract_metrics(&cleaned, &self.rules, Utc::now());

        let existing = with_timeout(self.store_timeout, self.stores.metrics.get(call_id)).await?;
        if existing.is_some_and(|stored| stored.same_content(&metrics)) {
            return Ok(PromotionResult::skipped(SkipReason::Unchanged));
        }

        with_timeout(self.store_timeout, self.stores.metrics.upsert(metrics)).await?;
        Ok(PromotionResult::written())
    }
}

fn missing(call_id: &str, target: Stage) -> PipelineError {
    PipelineError::MissingPredecessor {
        call_id: call_id.to_string(),
        target,
        required: target.predecessor().unwrap_or(Stage::Raw),
    }
}
