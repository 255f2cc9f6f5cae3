//! Crate-level error types for `llm-relay`.
//!
//! Provides a unified [`RelayError`] that composes errors from every
//! sub-module (replay, config, IO, serialization) together with
//! [`error_stack::Report`] for context-carrying error propagation on the
//! fallible I/O paths (replay-log load/save, config parse, report export).
//!
//! Per-request failures never travel through this type: admission failures
//! are returned synchronously from `submit` as
//! [`SubmitError`](crate::queue::SubmitError), and everything after admission
//! is delivered through the request's completion callback exactly once.

use thiserror::Error;

use crate::config::ConfigError;
use crate::replay::ReplayError;

/// Crate-level error type for `llm-relay`.
///
/// Wraps each sub-module's typed error via `#[from]` so that the `?`
/// operator converts them automatically.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    /// An error originating from the replay sub-system.
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    /// A configuration-related error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
///
/// Equivalent to `Result<T, error_stack::Report<RelayError>>`.
pub type RelayResult<T> = Result<T, error_stack::Report<RelayError>>;
