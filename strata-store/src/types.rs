//! Shared constants and identifier types.

/// Row identifier type.
pub type RowId = u64;

/// Threshold partitioning row-identifier space: committed rows live below,
/// transaction-local rows at or above. A single batch of row identifiers is
/// always homogeneous in which half it inhabits.
pub const MAX_ROW_ID: RowId = 1 << 62;

/// Rows per scan vector. Scan chunks never straddle a vector boundary.
pub const VECTOR_SIZE: usize = 2048;

/// Vectors per row group; also the default parallel-scan unit.
pub const ROW_GROUP_VECTOR_COUNT: usize = 64;

/// Rows per row group.
pub const ROW_GROUP_SIZE: usize = VECTOR_SIZE * ROW_GROUP_VECTOR_COUNT;

/// Pseudo column identifier projecting the row identifier in scans.
pub const COLUMN_IDENTIFIER_ROW_ID: usize = usize::MAX;

/// Field name used when the row identifier is projected.
pub const ROW_ID_COLUMN_NAME: &str = "rowid";
