//! Typed error hierarchy for the sync engine.
//!
//! Every failure the engine can observe is a [`SyncError`] variant, and each
//! variant carries a fixed [`FaultClass`]. The class is what the retry layer
//! and the status controller act on: transient faults are retried and, once
//! the budget is exhausted, defer the whole run; permanent faults end it.

use thiserror::Error;

/// Classification shared by the paginator's retry wrapper and the status
/// controller's deferral decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Worth retrying: the upstream may recover on its own.
    Transient,
    /// Retrying cannot help; the failure is structural or semantic.
    Permanent,
}

/// Errors from the sync engine and its collaborator ports.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Run cursor {current}/{total} is out of bounds")]
    InvalidCursor { current: u32, total: u32 },

    #[error("Job query is structurally invalid or names only empty sources")]
    QueryNotValid,

    #[error("Job {0} not found in the repository")]
    JobNotFound(crate::model::JobId),

    #[error("Source {source_name} does not exist upstream")]
    SourceNotFound { source_name: String },

    #[error("Remote call '{what}' timed out after {millis}ms")]
    Timeout { what: String, millis: u64 },

    #[error("Connection to upstream failed: {0}")]
    Connection(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    UpstreamHttp { status: u16, message: String },

    #[error("Upstream rejected continuation token: {0}")]
    MalformedToken(String),

    #[error("Upstream unavailable after {attempts} attempts: {last}")]
    UpstreamUnavailable { attempts: u32, last: String },

    #[error("Failed to write artifact at {path}: {source}")]
    BlobWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job repository error: {0}")]
    Repository(String),

    #[error("Step log '{scope}' is corrupt: {detail}")]
    StepLogCorrupt { scope: String, detail: String },

    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl SyncError {
    /// The fault class driving retry and deferral decisions.
    pub fn fault_class(&self) -> FaultClass {
        match self {
            SyncError::Timeout { .. }
            | SyncError::Connection(_)
            | SyncError::UpstreamUnavailable { .. } => FaultClass::Transient,
            SyncError::UpstreamHttp { status, .. } if *status >= 500 => FaultClass::Transient,
            SyncError::InvalidCursor { .. }
            | SyncError::QueryNotValid
            | SyncError::JobNotFound(_)
            | SyncError::SourceNotFound { .. }
            | SyncError::UpstreamHttp { .. }
            | SyncError::MalformedToken(_)
            | SyncError::BlobWrite { .. }
            | SyncError::Repository(_)
            | SyncError::StepLogCorrupt { .. }
            | SyncError::Unclassified(_) => FaultClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.fault_class() == FaultClass::Transient
    }
}
