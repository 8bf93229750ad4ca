//! Error types and result definitions for the Strata storage engine.
//!
//! Strata uses a single error enum ([`Error`]) across all crates rather than
//! crate-specific error types. This keeps error propagation with `?` natural
//! across crate boundaries and gives callers one surface to match on.
//!
//! # Error Categories
//!
//! - **Data format errors** ([`Error::Arrow`]): Arrow serialization issues
//! - **User input errors** ([`Error::InvalidArgumentError`]): bad parameters
//! - **Constraint violations** ([`Error::ConstraintError`]): NOT NULL, CHECK,
//!   UNIQUE and FOREIGN KEY failures, generated-column evaluation failures
//! - **Transaction conflicts** ([`Error::TransactionConflict`]): writes to a
//!   superseded table version
//! - **Catalog errors** ([`Error::CatalogError`]): schema changes forbidden
//!   by dependent objects
//! - **Internal errors** ([`Error::Internal`]): bugs or unexpected states

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
