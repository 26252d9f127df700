//! Error types for tag parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating entity identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The tag string has no `<kind>-` prefix.
    #[error("tag {0:?} missing kind separator")]
    MissingSeparator(String),

    /// The tag names an unknown kind, or a kind other than the expected one.
    #[error("invalid tag kind: expected '{expected}', got '{actual}'")]
    InvalidKind {
        expected: &'static str,
        actual: String,
    },

    /// The id portion does not match the kind's grammar.
    #[error("{id:?} is not a valid {kind} id")]
    InvalidId { kind: &'static str, id: String },

    /// The model UUID portion is invalid.
    #[error("invalid model uuid: {0}")]
    InvalidUuid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a kind mismatch.
    pub fn is_kind_error(&self) -> bool {
        matches!(self, IdError::InvalidKind { .. } | IdError::MissingSeparator(_))
    }
}
