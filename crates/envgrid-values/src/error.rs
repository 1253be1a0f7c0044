//! Error types for values document operations.

use thiserror::Error;

/// Result type alias for values operations.
pub type ValuesResult<T> = Result<T, ValuesError>;

/// Errors produced while parsing, merging or querying values documents.
#[derive(Debug, Error)]
pub enum ValuesError {
    #[error("malformed values document: {0}")]
    Parse(String),

    #[error("values document must be a mapping, found a {0}")]
    NotAMapping(&'static str),

    #[error("invalid key path `{0}`")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("image {field} key `{key}` has no value in merged values")]
    MissingImageField { field: &'static str, key: String },
}
