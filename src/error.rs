use thiserror::Error;

use crate::engine::job::JobId;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid target spec: {0}")]
    InvalidTargetSpec(String),

    #[error("Target spec expands to {requested} targets, limit is {limit}")]
    TargetSetTooLarge {
        requested: usize,
        limit: usize,
    },

    #[error("Failed to launch scanner: {0}")]
    LaunchFailed(String),

    #[error("Scan exceeded timeout of {seconds} seconds")]
    TimeoutExceeded {
        seconds: u64,
    },

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl From<anyhow::Error> for ScanError {
    fn from(error: anyhow::Error) -> Self {
        ScanError::UnexpectedError(error.to_string())
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
