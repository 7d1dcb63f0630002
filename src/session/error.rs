use std::path::{Path, PathBuf};
use thiserror::Error;

/// Outcome of a single extractor call that did not produce a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    /// One item could not be extracted; it is logged and the loop moves on.
    #[error("{0}")]
    Recoverable(String),
    /// The session cannot continue (missing credential, quota exhausted, ...).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExtractError {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Recoverable(r) | Self::Fatal(r) => r,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("invalid identifier {value:?}: expected an integer in [1, {workers}]")]
    InvalidIdentifier { value: String, workers: u32 },
    #[error("invalid range [{start}, {end}] for a work list of {len} items")]
    InvalidRange { start: i64, end: i64, len: usize },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("work source {}: {reason}", path.display())]
    WorkSource { path: PathBuf, reason: String },
    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("session {job}: {detail}")]
    InvalidState { job: String, detail: String },
    #[error("remote sync failed for {name}: {detail}")]
    Remote { name: String, detail: String },
    #[error("extraction aborted: {0}")]
    Aborted(#[source] ExtractError),
}

impl SessionError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn work_source(path: &Path, reason: impl Into<String>) -> Self {
        Self::WorkSource {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(job: &str, detail: impl Into<String>) -> Self {
        Self::InvalidState {
            job: job.to_string(),
            detail: detail.into(),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
