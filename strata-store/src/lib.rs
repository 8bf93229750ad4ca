//! Row-group storage for the Strata engine.
//!
//! A [`RowGroupCollection`] owns the committed rows of one table as a
//! sequence of fixed-capacity row groups. Each row carries
//! `created_by`/`deleted_by` transaction identifiers; scans evaluate MVCC
//! visibility against the caller's snapshot, and committed-only scan modes
//! serve index builds, append reverts and WAL writes.
//!
//! Chunks enter and leave as Arrow `RecordBatch` values. Row identifiers in
//! this collection are dense positions: row `r` lives in row group
//! `r / ROW_GROUP_SIZE` at offset `r % ROW_GROUP_SIZE`.

#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod collection;
pub mod row_group;
pub mod scan;
pub mod stats;
pub mod types;

pub use checkpoint::{MemoryTableDataWriter, RowGroupPointer, TableDataWriter, TablePointer};
pub use collection::{PersistentTableData, RowGroupAppendState, RowGroupCollection};
pub use scan::{ParallelRowGroupScanState, RowGroupScanState, TableScanType};
pub use stats::ColumnStats;
pub use types::{
    COLUMN_IDENTIFIER_ROW_ID, MAX_ROW_ID, ROW_GROUP_SIZE, ROW_GROUP_VECTOR_COUNT,
    ROW_ID_COLUMN_NAME, RowId, VECTOR_SIZE,
};
