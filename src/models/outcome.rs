use serde::Serialize;
use uuid::Uuid;

use super::Stage;

/// Attempt counters for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful promotions that did not need to write
    pub skipped: usize,
}

/// A record that did not make it through the pipeline in this run
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub call_id: String,
    pub stage: Stage,
    pub error: String,
    pub retryable: bool,
}

/// Summary of one batch-controller run. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub records_attempted: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    /// Indexed by `Stage::index()`
    pub per_stage_counts: [StageCounts; 3],
    pub failures: Vec<RecordFailure>,
    pub batches: usize,
    /// Set when the run was cancelled before every record was attempted
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            records_attempted: 0,
            records_succeeded: 0,
            records_failed: 0,
            per_stage_counts: [StageCounts::default(); 3],
            failures: Vec::new(),
            batches: 0,
            cancelled: false,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageCounts {
        &self.per_stage_counts[stage.index()]
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut StageCounts {
        &mut self.per_stage_counts[stage.index()]
    }

    pub fn is_clean(&self) -> bool {
        self.records_failed == 0
    }
}
