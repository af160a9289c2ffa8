use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{RawRecord, RecordFailure, RecordState, RunOutcome, Stage};
use crate::rules::RuleSet;
use crate::stages::StagePromoter;
use crate::store::{sort_by_source_order, with_timeout, IngestionSource, Stores};

/// Outcome of driving one record through the stages
#[derive(Debug)]
enum RecordRun {
    /// Not started because the run was cancelled
    NotStarted,
    Finished {
        call_id: String,
        /// Successful promotions in order, with whether each one wrote
        promoted: Vec<(Stage, bool)>,
        failure: Option<(Stage, PipelineError)>,
    },
}

/// Drives records from the ingestion source through Raw, Cleaned and Metrics.
///
/// Per-record failures are isolated into the returned [`RunOutcome`]; only an
/// unreachable store or source aborts a run with
/// [`PipelineError::BatchInfrastructure`].
pub struct BatchController {
    source: Arc<dyn IngestionSource>,
    promoter: StagePromoter,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl BatchController {
    pub fn new(
        source: Arc<dyn IngestionSource>,
        stores: Stores,
        rules: Arc<RuleSet>,
        config: PipelineConfig,
    ) -> Self {
        let promoter = StagePromoter::new(stores, rules, config.store_timeout);
        Self {
            source,
            promoter,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the controller from starting new record attempts
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn promoter(&self) -> &StagePromoter {
        &self.promoter
    }

    /// Process every available record that has not reached the metrics
    /// stage, in batches of `batch_size`
    pub async fn run_full(&self, batch_size: usize) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, mode = "full");
        self.full_run(run_id, batch_size).instrument(span).await
    }

    /// Process records newer than `since_marker`, or than the persisted
    /// watermark when no marker is given, advancing the watermark after each
    /// fully successful batch
    pub async fn run_incremental(
        &self,
        since_marker: Option<DateTime<Utc>>,
    ) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, mode = "incremental");
        self.incremental_run(run_id, since_marker).instrument(span).await
    }

    /// Re-run promotion for specific calls fetched from the source
    pub async fn reprocess(&self, call_ids: &[String]) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, mode = "reprocess");
        self.reprocess_run(run_id, call_ids).instrument(span).await
    }

    async fn full_run(&self, run_id: Uuid, batch_size: usize) -> Result<RunOutcome, PipelineError> {
        let mut outcome = RunOutcome::new(run_id);
        self.check_infrastructure().await?;

        let (available_count, pending) = self.scan_pending().await?;
        info!(
            available = available_count,
            pending = pending.len(),
            batch_size,
            "Starting full run"
        );

        for batch in pending.chunks(batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.process_batch(batch.to_vec(), &mut outcome).await;
        }

        finish(&outcome);
        Ok(outcome)
    }

    async fn incremental_run(
        &self,
        run_id: Uuid,
        since_marker: Option<DateTime<Utc>>,
    ) -> Result<RunOutcome, PipelineError> {
        let mut outcome = RunOutcome::new(run_id);
        self.check_infrastructure().await?;

        let persisted = self.read_watermark().await?;
        let marker = since_marker.or(persisted);

        let mut records = self.list_source(marker).await?;
        if drop_partial_group(&mut records, self.config.scan_limit.max(1)) {
            info!(
                listed = records.len(),
                scan_limit = self.config.scan_limit,
                "Listing hit the scan limit, later calls wait for the next run"
            );
        }
        let records = dedupe_by_call_id(records);
        let batches = timestamp_batches(records, self.config.batch_size);
        info!(
            marker = ?marker,
            batches = batches.len(),
            "Starting incremental run"
        );

        let mut watermark = persisted;
        let mut frozen = false;

        for batch in batches {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let Some(batch_max) = batch.last().map(|r| r.timestamp) else {
                continue;
            };
            let all_succeeded = self.process_batch(batch, &mut outcome).await;

            if !all_succeeded {
                if !frozen {
                    info!(batch = outcome.batches, "Batch incomplete, holding watermark");
                }
                frozen = true;
                continue;
            }

            if frozen || watermark.is_some_and(|current| current >= batch_max) {
                continue;
            }

            match self.write_watermark(batch_max).await {
                Ok(()) => {
                    debug!(watermark = %batch_max, "Watermark advanced");
                    watermark = Some(batch_max);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to persist watermark, holding it for this run");
                    frozen = true;
                }
            }
        }

        finish(&outcome);
        Ok(outcome)
    }

    async fn reprocess_run(
        &self,
        run_id: Uuid,
        call_ids: &[String],
    ) -> Result<RunOutcome, PipelineError> {
        let mut outcome = RunOutcome::new(run_id);
        self.check_infrastructure().await?;

        let mut records = Vec::with_capacity(call_ids.len());
        let mut seen = HashSet::new();
        for call_id in call_ids {
            if !seen.insert(call_id.as_str()) {
                continue;
            }
            let source = self.source.as_ref();
            let fetched = self
                .config
                .retry
                .run("fetch source record", move || async move {
                    source.fetch(call_id).await.map_err(PipelineError::from)
                })
                .await;

            match fetched {
                Ok(record) => records.push(record),
                Err(e) => {
                    outcome.records_attempted += 1;
                    outcome.stage_mut(Stage::Raw).attempted += 1;
                    record_failure(&mut outcome, call_id.clone(), Stage::Raw, e);
                }
            }
        }

        for batch in records.chunks(self.config.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.process_batch(batch.to_vec(), &mut outcome).await;
        }

        finish(&outcome);
        Ok(outcome)
    }

    /// Run one batch with bounded concurrency; true when every record in it
    /// reached the metrics stage
    async fn process_batch(&self, batch: Vec<RawRecord>, outcome: &mut RunOutcome) -> bool {
        outcome.batches += 1;
        let size = batch.len();

        let runs: Vec<RecordRun> = stream::iter(batch)
            .map(|record| self.process_record(record))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut all_succeeded = true;
        for run in runs {
            match run {
                RecordRun::NotStarted => {
                    outcome.cancelled = true;
                    all_succeeded = false;
                }
                RecordRun::Finished {
                    call_id,
                    promoted,
                    failure,
                } => {
                    outcome.records_attempted += 1;
                    for (stage, written) in promoted {
                        let counts = outcome.stage_mut(stage);
                        counts.attempted += 1;
                        counts.succeeded += 1;
                        if !written {
                            counts.skipped += 1;
                        }
                    }
                    match failure {
                        Some((stage, error)) => {
                            all_succeeded = false;
                            outcome.stage_mut(stage).attempted += 1;
                            record_failure(outcome, call_id, stage, error);
                        }
                        None => outcome.records_succeeded += 1,
                    }
                }
            }
        }

        debug!(batch = outcome.batches, size, all_succeeded, "Batch finished");
        all_succeeded
    }

    /// Promote one record through every stage in order, retrying transient
    /// failures; stops at the first stage that fails
    async fn process_record(&self, record: RawRecord) -> RecordRun {
        if self.cancel.is_cancelled() {
            return RecordRun::NotStarted;
        }

        let promoter = &self.promoter;
        let record = &record;
        let mut state = RecordState::Unseen;
        let mut promoted = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            if !state.can_promote_to(stage) {
                let required = stage.predecessor().unwrap_or(Stage::Raw);
                let error = PipelineError::MissingPredecessor {
                    call_id: record.call_id.clone(),
                    target: stage,
                    required,
                };
                return finished(record, promoted, Some((stage, error)));
            }

            let result = self
                .config
                .retry
                .run("promote", move || async move {
                    promoter.promote(record, stage).await
                })
                .await;

            match result {
                Ok(promotion) => {
                    state = state.advance(stage);
                    promoted.push((stage, promotion.written));
                }
                Err(e) => return finished(record, promoted, Some((stage, e))),
            }
        }

        finished(record, promoted, None)
    }

    /// Probe every store before a run; a store that stays unreachable after
    /// retries aborts the run
    async fn check_infrastructure(&self) -> Result<(), PipelineError> {
        let stores = self.promoter.stores();
        let limit = self.config.store_timeout;
        let retry = &self.config.retry;

        let probes = [
            (
                Stage::Raw,
                retry
                    .run("ping raw store", move || async move {
                        with_timeout(limit, stores.raw.ping()).await.map_err(PipelineError::from)
                    })
                    .await,
            ),
            (
                Stage::Cleaned,
                retry
                    .run("ping cleaned store", move || async move {
                        with_timeout(limit, stores.cleaned.ping()).await.map_err(PipelineError::from)
                    })
                    .await,
            ),
            (
                Stage::Metrics,
                retry
                    .run("ping metrics store", move || async move {
                        with_timeout(limit, stores.metrics.ping()).await.map_err(PipelineError::from)
                    })
                    .await,
            ),
        ];

        for (stage, result) in probes {
            if let Err(e) = result {
                return Err(PipelineError::BatchInfrastructure(format!(
                    "{stage} store unreachable: {e}"
                )));
            }
        }
        Ok(())
    }

    async fn list_source(
        &self,
        marker: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>, PipelineError> {
        let source = self.source.as_ref();
        let limit = self.config.scan_limit.max(1);

        let mut records = self
            .config
            .retry
            .run("list source", move || async move {
                source
                    .list_since(marker, limit)
                    .await
                    .map_err(PipelineError::from)
            })
            .await
            .map_err(|e| PipelineError::BatchInfrastructure(format!("ingestion source: {e}")))?;

        sort_by_source_order(&mut records);
        Ok(records)
    }

    /// Page through the source until `scan_limit` records still short of the
    /// metrics stage are found or the source is exhausted. Returns how many
    /// records were listed along with the pending ones.
    async fn scan_pending(&self) -> Result<(usize, Vec<RawRecord>), PipelineError> {
        let limit = self.config.scan_limit.max(1);
        let mut cursor = None;
        let mut listed = 0;
        let mut pending = Vec::new();

        loop {
            let mut page = self.list_source(cursor).await?;
            let more = drop_partial_group(&mut page, limit);
            let Some(last) = page.last().map(|r| r.timestamp) else {
                break;
            };
            listed += page.len();
            pending.extend(self.select_pending(page).await);

            if !more || pending.len() >= limit {
                break;
            }
            cursor = Some(last);
        }

        Ok((listed, dedupe_by_call_id(pending)))
    }

    /// Drop records already at the metrics stage, keeping source order
    async fn select_pending(&self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        let promoter = &self.promoter;
        let retry = &self.config.retry;

        let checked: Vec<(RawRecord, bool)> = stream::iter(records)
            .map(|record| async move {
                let call_id = record.call_id.as_str();
                let state = retry
                    .run("check record state", move || async move {
                        promoter.state_of(call_id).await
                    })
                    .await;
                let done = match state {
                    Ok(state) => state == RecordState::At(Stage::Metrics),
                    Err(e) => {
                        debug!(call_id, error = %e, "State check failed, treating as pending");
                        false
                    }
                };
                (record, done)
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        checked
            .into_iter()
            .filter_map(|(record, done)| (!done).then_some(record))
            .collect()
    }

    async fn read_watermark(&self) -> Result<Option<DateTime<Utc>>, PipelineError> {
        let watermark = self.promoter.stores().watermark.as_ref();
        let limit = self.config.store_timeout;

        self.config
            .retry
            .run("read watermark", move || async move {
                with_timeout(limit, watermark.read_watermark())
                    .await
                    .map_err(PipelineError::from)
            })
            .await
            .map_err(|e| PipelineError::BatchInfrastructure(format!("watermark store: {e}")))
    }

    async fn write_watermark(&self, value: DateTime<Utc>) -> Result<(), PipelineError> {
        let watermark = self.promoter.stores().watermark.as_ref();
        let limit = self.config.store_timeout;

        self.config
            .retry
            .run("write watermark", move || async move {
                with_timeout(limit, watermark.write_watermark(value))
                    .await
                    .map_err(PipelineError::from)
            })
            .await
    }
}

fn finished(
    record: &RawRecord,
    promoted: Vec<(Stage, bool)>,
    failure: Option<(Stage, PipelineError)>,
) -> RecordRun {
    RecordRun::Finished {
        call_id: record.call_id.clone(),
        promoted,
        failure,
    }
}

fn record_failure(outcome: &mut RunOutcome, call_id: String, stage: Stage, error: PipelineError) {
    warn!(call_id = %call_id, stage = %stage, error = %error, "Record failed");
    outcome.stage_mut(stage).failed += 1;
    outcome.records_failed += 1;
    outcome.failures.push(RecordFailure {
        call_id,
        stage,
        retryable: error.is_retryable(),
        error: error.to_string(),
    });
}

fn finish(outcome: &RunOutcome) {
    info!(
        attempted = outcome.records_attempted,
        succeeded = outcome.records_succeeded,
        failed = outcome.records_failed,
        batches = outcome.batches,
        cancelled = outcome.cancelled,
        "Run complete"
    );
}

/// Keep the first occurrence of each call id
fn dedupe_by_call_id(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(record.call_id.clone()) {
            unique.push(record);
        } else {
            warn!(call_id = %record.call_id, "Duplicate call id in source listing, ignoring");
        }
    }
    unique
}

/// A listing that came back with `limit` records may end partway through a
/// group sharing one timestamp. Drop that trailing group so the next listing
/// after the last kept timestamp returns it whole. Returns true when the
/// listing was cut by the limit.
fn drop_partial_group(records: &mut Vec<RawRecord>, limit: usize) -> bool {
    if records.len() < limit {
        return false;
    }
    let Some(last) = records.last().map(|r| r.timestamp) else {
        return false;
    };
    match records.iter().position(|r| r.timestamp == last) {
        Some(0) | None => warn!(
            timestamp = %last,
            limit,
            "Every listed call shares one timestamp; raise the scan limit to reach the rest"
        ),
        Some(first) => records.truncate(first),
    }
    true
}

/// Split source-ordered records into batches of about `batch_size`, never
/// separating records that share a timestamp
fn timestamp_batches(records: Vec<RawRecord>, batch_size: usize) -> Vec<Vec<RawRecord>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<RawRecord> = Vec::with_capacity(batch_size);

    for record in records {
        let boundary = current
            .last()
            .is_some_and(|last| last.timestamp != record.timestamp);
        if current.len() >= batch_size && boundary {
            batches.push(std::mem::take(&mut current));
        }
        current.push(record);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, StoreError};
    use crate::models::{CleanedRecord, MetricsRecord};
    use crate::pipeline::RetryPolicy;
    use crate::rules::RuleConfig;
    use crate::store::{Keyed, MemorySource, MemoryStore, MemoryWatermark, StageStore, WatermarkStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Memory store whose upserts fail a set number of times per key
    struct FlakyStore<R> {
        inner: MemoryStore<R>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl<R: Clone> FlakyStore<R> {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: Mutex::new(HashMap::new()),
            }
        }

        fn fail_upserts(&self, call_id: &str, times: usize) {
            self.failures.lock().unwrap().insert(call_id.to_string(), times);
        }
    }

    #[async_trait]
    impl<R> StageStore<R> for FlakyStore<R>
    where
        R: Keyed + Clone + Send + Sync + 'static,
    {
        async fn get(&self, call_id: &str) -> Result<Option<R>, StoreError> {
            self.inner.get(call_id).await
        }

        async fn upsert(&self, record: R) -> Result<(), StoreError> {
            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(record.key()) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(StoreError::Unavailable("injected failure".to_string()));
            }
            self.inner.upsert(record).await
        }

        async fn exists(&self, call_id: &str) -> Result<bool, StoreError> {
            self.inner.exists(call_id).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Store that cannot be reached at all
    struct DownStore;

    #[async_trait]
    impl<R: Send + Sync + 'static> StageStore<R> for DownStore {
        async fn get(&self, _call_id: &str) -> Result<Option<R>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn upsert(&self, _record: R) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn exists(&self, _call_id: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct DownSource;

    #[async_trait]
    impl IngestionSource for DownSource {
        async fn list_available(&self, _limit: usize) -> Result<Vec<RawRecord>, SourceError> {
            Err(SourceError::Unavailable("connection refused".to_string()))
        }

        async fn fetch(&self, _call_id: &str) -> Result<RawRecord, SourceError> {
            Err(SourceError::Unavailable("connection refused".to_string()))
        }
    }

    struct Harness {
        stores: Stores,
        raw: Arc<MemoryStore<RawRecord>>,
        cleaned: Arc<MemoryStore<CleanedRecord>>,
        metrics: Arc<FlakyStore<MetricsRecord>>,
        watermark: Arc<MemoryWatermark>,
    }

    fn harness() -> Harness {
        let raw = Arc::new(MemoryStore::new());
        let cleaned = Arc::new(MemoryStore::new());
        let metrics = Arc::new(FlakyStore::new());
        let watermark = Arc::new(MemoryWatermark::new());
        Harness {
            stores: Stores {
                raw: raw.clone(),
                cleaned: cleaned.clone(),
                metrics: metrics.clone(),
                watermark: watermark.clone(),
            },
            raw,
            cleaned,
            metrics,
            watermark,
        }
    }

    fn test_config(batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            concurrency: 4,
            store_timeout: Duration::from_secs(1),
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    fn controller(source: Arc<dyn IngestionSource>, stores: Stores, batch_size: usize) -> BatchController {
        let rules = Arc::new(RuleSet::compile(&RuleConfig::default()).unwrap());
        BatchController::new(source, stores, rules, test_config(batch_size))
    }

    fn scan_limited(source: Arc<dyn IngestionSource>, stores: Stores, scan_limit: usize) -> BatchController {
        let rules = Arc::new(RuleSet::compile(&RuleConfig::default()).unwrap());
        let config = PipelineConfig {
            scan_limit,
            ..test_config(1)
        };
        BatchController::new(source, stores, rules, config)
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn call(call_id: &str, hour: u32, text: &str) -> RawRecord {
        RawRecord {
            call_id: call_id.to_string(),
            agent_name: "sarah johnson".to_string(),
            timestamp: at(hour),
            transcript_text: text.to_string(),
        }
    }

    fn sample_calls() -> Vec<RawRecord> {
        vec![
            call("CALL_1", 9, "Customer: Sign me up, this is great."),
            call("CALL_2", 10, "Agent: Would you like an extra warranty for $30? Customer: No."),
            call("CALL_3", 11, "Customer: This is terrible, I am frustrated."),
        ]
    }

    #[tokio::test]
    async fn test_run_full_promotes_everything() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 2);

        let outcome = controller.run_full(2).await.unwrap();

        assert_eq!(outcome.records_attempted, 3);
        assert_eq!(outcome.records_succeeded, 3);
        assert_eq!(outcome.records_failed, 0);
        assert_eq!(outcome.batches, 2);
        for stage in Stage::ALL {
            assert_eq!(outcome.stage(stage).succeeded, 3);
        }
        assert_eq!(h.metrics.inner.len().await, 3);
        let metrics = h.metrics.get("CALL_2").await.unwrap().unwrap();
        assert_eq!(metrics.upsell_amount.0, 3_000);
    }

    #[tokio::test]
    async fn test_run_full_skips_completed_records() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source.clone(), h.stores.clone(), 10);

        controller.run_full(10).await.unwrap();
        source.push(call("CALL_4", 12, "Count me in.")).await;
        let second = controller.run_full(10).await.unwrap();

        assert_eq!(second.records_attempted, 1);
        assert_eq!(second.records_succeeded, 1);
        assert_eq!(h.raw.len().await, 4);
        assert_eq!(h.metrics.inner.len().await, 4);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let h = harness();
        let mut calls = sample_calls();
        calls.push(call("CALL_BAD", 12, "   "));
        let source = Arc::new(MemorySource::new(calls));
        let controller = controller(source, h.stores.clone(), 10);

        let outcome = controller.run_full(10).await.unwrap();

        assert_eq!(outcome.records_attempted, 4);
        assert_eq!(outcome.records_succeeded, 3);
        assert_eq!(outcome.records_failed, 1);
        assert_eq!(outcome.failures[0].call_id, "CALL_BAD");
        assert_eq!(outcome.failures[0].stage, Stage::Cleaned);
        assert!(!outcome.failures[0].retryable);
        assert_eq!(outcome.stage(Stage::Raw).succeeded, 4);
        assert_eq!(outcome.stage(Stage::Cleaned).failed, 1);
        assert_eq!(h.cleaned.len().await, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness();
        h.metrics.fail_upserts("CALL_2", 2);
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);

        let outcome = controller.run_full(10).await.unwrap();

        assert_eq!(outcome.records_succeeded, 3);
        assert!(outcome.is_clean());
        assert!(h.metrics.exists("CALL_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_only_that_record() {
        let h = harness();
        h.metrics.fail_upserts("CALL_2", 10);
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);

        let outcome = controller.run_full(10).await.unwrap();

        assert_eq!(outcome.records_succeeded, 2);
        assert_eq!(outcome.records_failed, 1);
        assert_eq!(outcome.failures[0].stage, Stage::Metrics);
        assert!(outcome.failures[0].retryable);
        assert_eq!(outcome.stage(Stage::Metrics).failed, 1);
    }

    #[tokio::test]
    async fn test_incremental_holds_watermark_on_failure() {
        let h = harness();
        h.metrics.fail_upserts("CALL_2", 10);
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);

        let first = controller.run_incremental(None).await.unwrap();
        assert_eq!(first.records_failed, 1);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), None);

        h.metrics.fail_upserts("CALL_2", 0);
        let second = controller.run_incremental(None).await.unwrap();

        assert_eq!(second.records_attempted, 3);
        assert!(second.is_clean());
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(11)));
        assert_eq!(h.raw.len().await, 3);
        assert_eq!(h.cleaned.len().await, 3);
        assert_eq!(h.metrics.inner.len().await, 3);
    }

    #[tokio::test]
    async fn test_incremental_freezes_watermark_after_failed_batch() {
        let h = harness();
        let source = Arc::new(MemorySource::new(vec![
            call("CALL_A", 9, "Sign me up."),
            call("CALL_B", 10, ""),
            call("CALL_C", 11, "Let's proceed."),
        ]));
        let controller = controller(source, h.stores.clone(), 1);

        let outcome = controller.run_incremental(None).await.unwrap();

        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.records_succeeded, 2);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(9)));
        assert!(h.metrics.exists("CALL_C").await.unwrap());
    }

    #[tokio::test]
    async fn test_incremental_only_processes_newer_records() {
        let h = harness();
        h.watermark.write_watermark(at(10)).await.unwrap();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);

        let outcome = controller.run_incremental(None).await.unwrap();
        assert_eq!(outcome.records_attempted, 1);
        assert!(h.metrics.exists("CALL_3").await.unwrap());
        assert!(!h.metrics.exists("CALL_1").await.unwrap());

        let explicit = controller.run_incremental(Some(at(8))).await.unwrap();
        assert_eq!(explicit.records_attempted, 3);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(11)));
    }

    #[test]
    fn test_batches_never_split_a_timestamp() {
        let records = vec![
            call("A", 1, "x"),
            call("B", 1, "x"),
            call("C", 1, "x"),
            call("D", 2, "x"),
            call("E", 3, "x"),
        ];
        let sizes: Vec<usize> = timestamp_batches(records, 2).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_run_full_pages_past_completed_records() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = scan_limited(source, h.stores.clone(), 2);

        let first = controller.run_full(1).await.unwrap();
        assert_eq!(first.records_attempted, 2);

        let second = controller.run_full(1).await.unwrap();
        assert_eq!(second.records_attempted, 1);
        assert!(h.metrics.exists("CALL_3").await.unwrap());

        let third = controller.run_full(1).await.unwrap();
        assert_eq!(third.records_attempted, 0);
        assert_eq!(h.metrics.inner.len().await, 3);
    }

    #[tokio::test]
    async fn test_incremental_reaches_records_beyond_scan_limit() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = scan_limited(source, h.stores.clone(), 2);

        for _ in 0..3 {
            controller.run_incremental(None).await.unwrap();
        }

        assert!(h.metrics.exists("CALL_3").await.unwrap());
        assert_eq!(h.metrics.inner.len().await, 3);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(11)));
    }

    #[tokio::test]
    async fn test_scan_limit_does_not_strand_shared_timestamp() {
        let h = harness();
        let source = Arc::new(MemorySource::new(vec![
            call("CALL_A", 9, "Sign me up."),
            call("CALL_B", 10, "Let's proceed."),
            call("CALL_C", 10, "Count me in."),
        ]));
        let controller = scan_limited(source, h.stores.clone(), 2);

        let first = controller.run_incremental(None).await.unwrap();
        assert_eq!(first.records_attempted, 1);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(9)));

        let second = controller.run_incremental(None).await.unwrap();
        assert_eq!(second.records_attempted, 2);
        assert!(h.metrics.exists("CALL_B").await.unwrap());
        assert!(h.metrics.exists("CALL_C").await.unwrap());
        assert_eq!(h.watermark.read_watermark().await.unwrap(), Some(at(10)));
    }

    #[test]
    fn test_drop_partial_group() {
        let mut cut = vec![call("A", 1, "x"), call("B", 2, "x"), call("C", 2, "x")];
        assert!(drop_partial_group(&mut cut, 3));
        assert_eq!(cut.len(), 1);

        let mut short = vec![call("A", 1, "x"), call("B", 2, "x")];
        assert!(!drop_partial_group(&mut short, 3));
        assert_eq!(short.len(), 2);

        let mut single_group = vec![call("A", 1, "x"), call("B", 1, "x")];
        assert!(drop_partial_group(&mut single_group, 2));
        assert_eq!(single_group.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts_run() {
        let mut h = harness();
        h.stores.cleaned = Arc::new(DownStore);
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);

        let err = controller.run_full(10).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cleaned store"));
        assert!(h.raw.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreachable_source_aborts_run() {
        let h = harness();
        let controller = controller(Arc::new(DownSource), h.stores.clone(), 10);

        let err = controller.run_incremental(None).await.unwrap_err();
        assert!(matches!(err, PipelineError::BatchInfrastructure(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 1);
        controller.cancellation_token().cancel();

        let outcome = controller.run_incremental(None).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.records_attempted, 0);
        assert!(h.raw.is_empty().await);
        assert_eq!(h.watermark.read_watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reprocess_fetches_named_calls() {
        let h = harness();
        let source = Arc::new(MemorySource::new(sample_calls()));
        let controller = controller(source, h.stores.clone(), 10);
        controller.run_full(10).await.unwrap();

        let ids = vec!["CALL_1".to_string(), "CALL_404".to_string()];
        let outcome = controller.reprocess(&ids).await.unwrap();

        assert_eq!(outcome.records_attempted, 2);
        assert_eq!(outcome.records_succeeded, 1);
        assert_eq!(outcome.failures[0].call_id, "CALL_404");
        // Nothing changed, so every stage of CALL_1 was skipped
        assert_eq!(outcome.stage(Stage::Metrics).skipped, 1);
        assert_eq!(h.metrics.inner.len().await, 3);
    }
}
