use std::time::Duration;

use thiserror::Error;

use crate::models::Stage;

/// Failures reported by a stage store or watermark store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Timeouts and unavailability may clear up on retry; corruption will not
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Corrupt { .. })
    }
}

/// Failures reported by an ingestion source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("ingestion source unavailable: {0}")]
    Unavailable(String),

    #[error("call {0} not found at source")]
    NotFound(String),

    #[error("malformed source record {id}: {reason}")]
    Malformed { id: String, reason: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Errors surfaced by the transformation and orchestration engine
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input for call {call_id}: {reason}")]
    InvalidInput { call_id: String, reason: String },

    #[error("cannot promote call {call_id} to {target}: no {required} record")]
    MissingPredecessor {
        call_id: String,
        target: Stage,
        required: Stage,
    },

    #[error("transient store failure: {0}")]
    TransientStore(#[source] StoreError),

    #[error("store failure: {0}")]
    Storage(#[source] StoreError),

    #[error("source failure: {0}")]
    Source(#[from] SourceError),

    #[error("batch infrastructure failure: {0}")]
    BatchInfrastructure(String),
}

impl PipelineError {
    pub fn invalid_input(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidInput {
            call_id: call_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the batch controller should retry the attempt that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientStore(_) => true,
            PipelineError::Source(e) => e.is_transient(),
            PipelineError::InvalidInput { .. }
            | PipelineError::MissingPredecessor { .. }
            | PipelineError::Storage(_)
            | PipelineError::BatchInfrastructure(_) => false,
        }
    }

    /// Whether the error should abort the whole run rather than one record
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::BatchInfrastructure(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            PipelineError::TransientStore(err)
        } else {
            PipelineError::Storage(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
