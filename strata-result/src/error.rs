use thiserror::Error;

/// Unified error type for all Strata operations.
///
/// Errors propagate upward through the call stack with the `?` operator. At
/// API boundaries they are typically converted to user-facing messages;
/// internal code matches on specific variants for fine-grained handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Arrow library error during columnar data operations.
    ///
    /// Raised when building record batches or arrays fails, or when a batch
    /// does not match its declared schema. Arrow is the interchange format
    /// for every chunk that crosses a Strata API boundary.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Invalid user input or API parameter.
    ///
    /// The message describes what was invalid and why. These errors are
    /// recoverable: fix the input and retry the operation.
    #[error("Invalid argument: {0}")]
    InvalidArgumentError(String),

    /// Catalog metadata error.
    ///
    /// Raised when a schema change is forbidden by a dependent object, for
    /// example dropping a column that an index still references.
    #[error("{0}")]
    CatalogError(String),

    /// Data constraint violation.
    ///
    /// Covers NOT NULL, CHECK, UNIQUE and FOREIGN KEY failures as well as
    /// generated-column expression failures. Expected during normal
    /// operation; the transaction that triggered the violation aborts.
    #[error("Constraint Error: {0}")]
    ConstraintError(String),

    /// Transaction conflict.
    ///
    /// Raised when a transaction writes to a table version that has been
    /// superseded by a schema change. The transaction must abort and retry
    /// against the current version.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Operation not supported at this site.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Internal error indicating a bug or unexpected state.
    ///
    /// Should never occur during normal operation; the message names the
    /// violated invariant.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error indicates a bug rather than a user-facing failure.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}
