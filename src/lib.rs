pub mod config;
pub mod error;
pub mod io;
pub mod models;
pub mod pipeline;
pub mod rules;
pub mod stages;
pub mod store;

pub use config::PipelineConfig;
pub use error::{PipelineError, SourceError, StoreError};
pub use io::{DirectorySource, HttpSource, PerformanceReport};
pub use models::{
    CleanedRecord, MetricsRecord, PromotionResult, RawRecord, RunOutcome, Sentiment, Stage,
};
pub use pipeline::{BatchController, RetryPolicy};
pub use rules::{RuleConfig, RuleSet};
pub use stages::{normalize, StagePromoter};
pub use store::{FileBackend, IngestionSource, StageStore, Stores, WatermarkStore};
