//! Error types for the trellis-core crate.

use thiserror::Error;

/// Failure to resolve a dotted path such as `"G_metrics.loss"` or `"batch.0"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("key '{segment}' not found while resolving '{path}'")]
    KeyNotFound { path: String, segment: String },

    #[error("index {index} out of range (len {len}) while resolving '{path}'")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("segment '{segment}' is not a valid sequence index in '{path}'")]
    InvalidIndex { path: String, segment: String },

    #[error("cannot index into a {kind} with '{segment}' while resolving '{path}'")]
    NotIndexable {
        path: String,
        segment: String,
        kind: &'static str,
    },
}

/// Top-level error type for recipe runs.
///
/// Nothing inside the loop catches these: a failing step or callback unwinds
/// straight out of [`Recipe::run`](crate::recipe::Recipe::run).
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Path resolution error: {0}")]
    Path(#[from] PathError),

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Reserved state key '{key}' must hold a mapping, got {kind}")]
    ReservedKey { key: String, kind: &'static str },

    #[error("Type mismatch for '{key}': expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Data source error: {0}")]
    Data(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Shared handle poisoned: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RecipeError {
    pub fn step(msg: impl Into<String>) -> Self {
        Self::Step(msg.into())
    }

    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Convert a poisoned mutex guard into an error instead of panicking.
    pub fn poisoned<T>(what: &str, _err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(what.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = RecipeError> = std::result::Result<T, E>;
