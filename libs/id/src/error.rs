//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has the wrong prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID has no separator between prefix and ULID.
    #[error("ID missing separator")]
    MissingSeparator,

    /// The ULID portion is not a valid ULID.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
