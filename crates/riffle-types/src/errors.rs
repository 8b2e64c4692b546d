use crate::{EdgeId, PartitionId};
use thiserror::Error;

pub type Result<T, E = WatermarkError> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum WatermarkError {
    #[error("invalid configuration for {field}: {reason}")]
    Configuration { field: &'static str, reason: String },
    #[error("checkpoint does not match the current {kind} set: expected {expected:?}, found {found:?}")]
    RestoreMismatch {
        kind: &'static str,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("failed to encode or decode snapshot: {0}")]
    Snapshot(String),
    #[error("{0} is not assigned to this source")]
    UnknownPartition(PartitionId),
    #[error("{0} is not an input of this operator")]
    UnknownEdge(EdgeId),
}

impl WatermarkError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        WatermarkError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// True for errors that must abort recovery rather than be logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatermarkError::RestoreMismatch { .. } | WatermarkError::Snapshot(_)
        )
    }
}
