use crate::error::Error;

/// Result alias used across all Strata crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;
