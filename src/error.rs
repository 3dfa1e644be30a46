//! Tagged, non-recoverable build errors.
//!
//! Most fallible functions in this crate return [`anyhow::Result`]. The
//! conditions below abort the in-flight transaction and are never retried,
//! so they carry a stable code that callers (and tests) can match on with
//! `err.downcast_ref::<BuildError>()`.
//!
//! Soft conditions (clamped vectors, vocabulary growth skips, ANN
//! unavailability) are not errors; see [`crate::report::WarningLog`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Vocabulary and posting-list counts disagree for one ingest batch.
    #[error("[{code}] {dataset}: {detail}", code = BuildError::CARDINALITY_CODE)]
    Cardinality { dataset: String, detail: String },

    /// A value that must be an exact non-negative integer was not.
    #[error("[{code}] {field} must be a non-negative integer, got {value}", code = BuildError::NON_INTEGER_CODE)]
    NonInteger { field: String, value: String },

    /// A meta file names shard parts that do not exist on disk.
    #[error("[{code}] missing {dataset} parts: {}", .missing.join(", "), code = BuildError::MISSING_PARTS_CODE)]
    MissingParts { dataset: String, missing: Vec<String> },

    /// A configured ANN table or column name is not a plain identifier.
    #[error("[{code}] unsafe {role} identifier: {value:?}", code = BuildError::UNSAFE_IDENTIFIER_CODE)]
    UnsafeIdentifier { role: &'static str, value: String },

    /// Post-commit validation rejected the built store.
    #[error("[{code}] {0}", code = BuildError::VALIDATION_CODE)]
    Validation(String),
}

impl BuildError {
    pub const CARDINALITY_CODE: &'static str = "ERR_SQLITE_TOKEN_CARDINALITY";
    pub const NON_INTEGER_CODE: &'static str = "ERR_SQLITE_NON_INTEGER";
    pub const MISSING_PARTS_CODE: &'static str = "ERR_SQLITE_MISSING_PARTS";
    pub const UNSAFE_IDENTIFIER_CODE: &'static str = "ERR_SQLITE_UNSAFE_IDENTIFIER";
    pub const VALIDATION_CODE: &'static str = "ERR_SQLITE_VALIDATION";

    pub fn code(&self) -> &'static str {
        match self {
            BuildError::Cardinality { .. } => Self::CARDINALITY_CODE,
            BuildError::NonInteger { .. } => Self::NON_INTEGER_CODE,
            BuildError::MissingParts { .. } => Self::MISSING_PARTS_CODE,
            BuildError::UnsafeIdentifier { .. } => Self::UNSAFE_IDENTIFIER_CODE,
            BuildError::Validation(_) => Self::VALIDATION_CODE,
        }
    }

    pub fn cardinality(dataset: &str, detail: impl Into<String>) -> Self {
        BuildError::Cardinality {
            dataset: dataset.to_string(),
            detail: detail.into(),
        }
    }
}

/// True when `err` wraps a [`BuildError`], i.e. it must not be swallowed by
/// a fallback path.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BuildError>().is_some()
}
