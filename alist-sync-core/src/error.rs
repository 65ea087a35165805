//! Error taxonomy for the sync engine. See spec.md §7.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid YAML, missing required fields, or an unknown mode. Fatal at
    /// startup.
    #[error("config error: {0}")]
    Config(String),

    /// Non-200 from the upstream file API, or a network timeout.
    #[error("upstream error: {code}: {message}")]
    Upstream { code: u16, message: String },

    /// Non-zero exit / failure from the download step.
    #[error("downloader error: {0}")]
    Downloader(String),

    /// Non-200 from PUT.
    #[error("upload error: {0}")]
    Upload(String),

    /// Post-transfer verification could not confirm.
    #[error("recheck error: {0}")]
    Recheck(String),

    /// Internal: the action selector could not choose an action for
    /// `(kind, status)`. Indicates a programming bug.
    #[error("status error: no action for worker {worker_id} in state {status}")]
    Status { worker_id: String, status: String },

    /// A subdirectory listing failed; logged and swallowed by the caller,
    /// but callers that need the error (e.g. tests) can still observe it.
    #[error("scanner error on {path}: {source}")]
    Scanner {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// A newly derived intent collides with a live Worker's claimed URIs.
    #[error("lock conflict on {0}")]
    LockConflict(String),

    /// Sync group spans more than one upstream server for an action that
    /// would require an inter-server transfer.
    #[error("cross-server transfer rejected: {source} -> {target}")]
    CrossServer { source: String, target: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Persistence(_))
    }
}
