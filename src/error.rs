use thiserror::Error;

use crate::storage::DatabaseError;

/// Errors surfaced by entity, index and aggregate operations.
///
/// Absence is never an error: lookups return `None` or an empty `Vec`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule was violated (duplicate name in a scope, duplicate id).
    #[error("Duplicate {kind}: {key}")]
    DuplicateKey { kind: &'static str, key: String },

    /// A unique attribute value is claimed by more than one entity.
    #[error("Index inconsistency: {attribute}={value} is claimed by {owners:?}")]
    IndexInconsistency {
        attribute: String,
        value: String,
        owners: Vec<String>,
    },

    /// A version-checked aggregate write lost against a concurrent writer.
    #[error("Concurrent modification of {kind} {key}")]
    ConcurrentModification { kind: &'static str, key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connectivity or storage failure from the underlying store.
    #[error("Database error: {0}")]
    Transient(#[from] DatabaseError),
}

impl StoreError {
    pub fn duplicate(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::DuplicateKey {
            kind,
            key: key.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
