use std::fmt;

use serde::{Deserialize, Serialize};

/// Refinement stage a record can reach, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Cleaned,
    Metrics,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Raw, Stage::Cleaned, Stage::Metrics];

    /// The stage whose record must exist before this one can be written
    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Raw => None,
            Stage::Cleaned => Some(Stage::Raw),
            Stage::Metrics => Some(Stage::Cleaned),
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Raw => Some(Stage::Cleaned),
            Stage::Cleaned => Some(Stage::Metrics),
            Stage::Metrics => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Raw => "raw",
            Stage::Cleaned => "cleaned",
            Stage::Metrics => "metrics",
        };
        f.write_str(name)
    }
}

/// Per-record position in the pipeline.
///
/// A record only ever moves forward one stage at a time; the highest stage
/// reached so far is the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    #[default]
    Unseen,
    At(Stage),
}

impl RecordState {
    /// Whether a promotion into `target` is allowed from this state.
    ///
    /// Re-promoting into a stage already reached (or below it) is allowed,
    /// since promotion is an idempotent upsert.
    pub fn can_promote_to(self, target: Stage) -> bool {
        match (self, target.predecessor()) {
            (_, None) => true,
            (RecordState::Unseen, Some(_)) => false,
            (RecordState::At(reached), Some(required)) => reached >= required,
        }
    }

    /// Apply a successful promotion
    pub fn advance(self, target: Stage) -> RecordState {
        match self {
            RecordState::At(reached) if reached >= target => self,
            _ => RecordState::At(target),
        }
    }

    pub fn reached(self) -> Option<Stage> {
        match self {
            RecordState::Unseen => None,
            RecordState::At(stage) => Some(stage),
        }
    }
}

/// Why a promotion did not write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Stored row already holds the same derived content
    Unchanged,
    /// A different raw record already exists under this key
    RawConflict,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unchanged => f.write_str("unchanged"),
            SkipReason::RawConflict => f.write_str("raw record conflict"),
        }
    }
}

/// Result of a single promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionResult {
    pub written: bool,
    pub skipped_reason: Option<SkipReason>,
}

impl PromotionResult {
    pub fn written() -> Self {
        Self {
            written: true,
            skipped_reason: None,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            written: false,
            skipped_reason: Some(reason),
        }
    }
}
