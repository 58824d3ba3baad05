use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatchError>;

/// One failed per-scan task of a parallel operation.
#[derive(Debug)]
pub struct TaskFailure {
    pub position: usize,
    pub identifier: String,
    pub error: BatchError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan {} ({}): {}", self.position, self.identifier, self.error)
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Scan {0} is out of range")]
    OutOfRange(String),

    #[error("Unsupported load format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Nodule info must be loaded before calling this operation")]
    MissingNodules,

    #[error("Target shape must be given to resize")]
    MissingShape,

    #[error("Nodule table is stale: {0}")]
    StaleNodules(String),

    #[error("{} of {total} scan tasks failed: {}", .failures.len(), join_failures(.failures))]
    PartialFailure {
        total: usize,
        failures: Vec<TaskFailure>,
    },

    #[error("Scan task panicked: {0}")]
    TaskPanicked(String),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("No valid DICOM images found in {0}")]
    NoValidImages(PathBuf),

    #[error("DICOM pixel data error in {path}: {message}")]
    PixelData { path: PathBuf, message: String },

    #[error("Malformed MetaImage {path}: {message}")]
    MetaImage { path: PathBuf, message: String },

    #[error("Failed to read annotations: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to parse config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Malformed blob: {0}")]
    Blob(String),
}

impl BatchError {
    /// Scan positions whose tasks failed, empty for anything but `PartialFailure`.
    pub fn failed_positions(&self) -> Vec<usize> {
        match self {
            BatchError::PartialFailure { failures, .. } => {
                failures.iter().map(|failure| failure.position).collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        BatchError::InvalidArgument(message.into())
    }
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_lists_positions_in_message() {
        let err = BatchError::PartialFailure {
            total: 4,
            failures: vec![TaskFailure {
                position: 2,
                identifier: "c".to_string(),
                error: BatchError::TaskPanicked("boom".to_string()),
            }],
        };
        assert_eq!(err.failed_positions(), vec![2]);
        let message = err.to_string();
        assert!(message.starts_with("1 of 4 scan tasks failed"));
        assert!(message.contains("scan 2 (c)"));
    }

    #[test]
    fn other_errors_have_no_failed_positions() {
        assert!(BatchError::MissingShape.failed_positions().is_empty());
    }
}
