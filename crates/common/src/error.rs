//! Error types for reftest

use thiserror::Error;

/// Result type alias using the reftest Error
pub type Result<T> = std::result::Result<T, Error>;

/// Reftest error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Unrecognized test IDs: {}", .0.join(" "))]
    UnknownTaskIds(Vec<String>),

    #[error("No session for browser {0}")]
    UnknownSession(String),

    #[error("Unknown task {task} in session {browser}")]
    UnknownTask { browser: String, task: String },

    #[error("Results for {browser}:{task}:{round}:{page} were already submitted")]
    DuplicateResult {
        browser: String,
        task: String,
        round: usize,
        page: usize,
    },

    #[error("Invalid result slot for {browser}:{task}: {reason}")]
    InvalidSlot {
        browser: String,
        task: String,
        reason: String,
    },

    #[error("{0} exists -- unable to proceed with testing")]
    StaleTmpDir(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Protocol violations are logged and never stop the run.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownSession(_)
                | Error::UnknownTask { .. }
                | Error::DuplicateResult { .. }
                | Error::InvalidSlot { .. }
        )
    }

    /// Run-fatal errors abort before any session starts.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownTaskIds(_)
                | Error::InvalidManifest(_)
                | Error::StaleTmpDir(_)
                | Error::InvalidConfig(_)
        )
    }
}
