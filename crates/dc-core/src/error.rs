//! Error types shared by the datacard crates.

use thiserror::Error;

/// Error type for datacard building, parsing and fit-result extraction.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Datacard text parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// A mandatory input artifact is not on disk
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    /// External fitter invocation failed
    #[error("External tool error: {0}")]
    External(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
