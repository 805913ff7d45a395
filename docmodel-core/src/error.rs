//! Error types and result types for object-document mapping operations.
//!
//! Validation and query-compilation failures are produced locally, before any
//! request reaches the executor. Store-reported failures are wrapped into the
//! same taxonomy but never retried. Use [`OdmResult<T>`] as the return type for
//! fallible operations.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Accumulated validation failures, keyed by dotted attribute path.
///
/// Validation never stops at the first problem: every offending path is
/// recorded so the caller can fix all of them at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    errors: BTreeMap<String, String>,
}

impl ValidationError {
    /// Creates an empty error set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an error set holding a single path/reason pair.
    pub fn single(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut error = Self::new();
        error.add(path, reason);
        error
    }

    /// Records a failure at `path`. A second failure at the same path is appended
    /// to the existing reason.
    pub fn add(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        let reason = reason.into();

        self.errors
            .entry(path.into())
            .and_modify(|existing| {
                existing.push_str("; ");
                existing.push_str(&reason);
            })
            .or_insert(reason);
    }

    /// Merges every failure of `other` into this set.
    pub fn merge(&mut self, other: ValidationError) {
        for (path, reason) in other.errors {
            self.add(path, reason);
        }
    }

    /// Returns `true` if no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of failing paths.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The reason recorded for `path`, if any.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.errors.get(path).map(String::as_str)
    }

    /// All failures as a path → reason map.
    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invalid field(s)", self.errors.len())?;

        for (index, (path, reason)) in self.errors.iter().enumerate() {
            let separator = if index == 0 { ": " } else { ", " };
            write!(f, "{separator}{path} ({reason})")?;
        }

        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Represents all errors surfaced by the mapping layer.
#[derive(Error, Debug)]
pub enum OdmError {
    /// One or more attributes failed validation. Always recoverable: fix the
    /// listed paths and retry.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    /// A filter, projection, sort or update referenced an unknown path or used
    /// an operator incorrectly. Raised before anything reaches the wire.
    #[error("Invalid query on '{path}' ({operator}): {reason}")]
    InvalidQuery {
        path: String,
        operator: String,
        reason: String,
    },
    /// An attribute that the schema does not declare was assigned.
    #[error("Unknown field '{field}' on schema {schema}")]
    UnknownField { schema: String, field: String },
    /// A mutation path could not be walked.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    /// The requested schema is not registered.
    #[error("Unknown schema: {0}")]
    UnknownSchema(String),
    /// A schema or registry declaration is inconsistent.
    #[error("Invalid definition of schema {schema}: {reason}")]
    SchemaDefinition { schema: String, reason: String },
    /// The store rejected a write because of a unique constraint.
    #[error("Duplicate key in collection {collection}: {message}")]
    NotUnique { collection: String, message: String },
    /// The store rejected an operation.
    #[error("Operation failed on collection {collection}: {message}")]
    Operation { collection: String, message: String },
    /// A conditional save matched no document. Nothing was written.
    #[error("Document {id} in collection {collection} was not saved: {reason}")]
    NotSaved {
        collection: String,
        id: String,
        reason: String,
    },
    /// A query expecting exactly one document found none.
    #[error("{schema} matching query does not exist")]
    DoesNotExist { schema: String },
    /// A query expecting exactly one document found several.
    #[error("Query for {schema} returned more than one document")]
    MultipleObjectsReturned { schema: String },
    /// The executor could not reach the store.
    #[error("Connection error: {0}")]
    Connection(String),
    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),
    /// An operation was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// Serialization/deserialization error when converting between formats (BSON, JSON, serde).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error while building a context or executor.
    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// A specialized `Result` type for mapping operations.
pub type OdmResult<T> = Result<T, OdmError>;

impl OdmError {
    pub(crate) fn invalid_query(
        path: impl Into<String>,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        OdmError::InvalidQuery {
            path: path.into(),
            operator: operator.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        OdmError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Builds an [`OdmError::Operation`] for `collection`.
    pub fn operation(collection: impl Into<String>, message: impl Into<String>) -> Self {
        OdmError::Operation {
            collection: collection.into(),
            message: message.into(),
        }
    }
}

impl From<BsonError> for OdmError {
    fn from(err: BsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for OdmError {
    fn from(err: SerdeJsonError) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_accumulates_per_path() {
        let mut error = ValidationError::new();
        error.add("name", "Field is required");
        error.add("tags.1", "Expected string, got int");
        error.add("name", "Too short");

        assert_eq!(error.len(), 2);
        assert_eq!(error.get("name"), Some("Field is required; Too short"));
        assert!(error.to_string().starts_with("2 invalid field(s)"));
    }

    #[test]
    fn test_empty_validation_error_is_ok() {
        assert!(ValidationError::new().into_result().is_ok());
        assert!(ValidationError::single("a", "bad").into_result().is_err());
    }
}
