//! Error types for the handful of recoverable conditions at the crate boundary.
//!
//! Internal invariant violations (a bad operand width, a method index read
//! before assignment, a label bound at the wrong stack height, ...) are not
//! represented here: they abort via `panic!`/`debug_assert!` at the call
//! site, matching the "fatal invariant violation" half of the error model.
//! This type only covers the "recoverable/signalling" half: configuration
//! loading and the sink's own finalization precondition.

use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("image sink rejected finalization: {0}")]
    Finalize(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
