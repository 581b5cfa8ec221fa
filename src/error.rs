//! Error types for the data store adapters and loader configuration.
//!
//! A missing row is never an error: point loaders resolve it to `None` and
//! list loaders to an empty list.

use thiserror::Error;

/// Result type alias for data store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A failed data store call. Loaders hand a clone of the same error to every
/// future in the failed batch, so this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached at all
    #[error("data store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed a query
    #[error("query against `{table}` failed: {message}")]
    Query { table: &'static str, message: String },
}

/// Invalid loader configuration, reported when a loader set is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{field}`: expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl ConfigError {
    pub fn validation_failed(message: impl Into<String>) -> Self {
        ConfigError::Validation(message.into())
    }
}
