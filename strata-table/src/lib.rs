//! The `DataTable` subsystem: physical storage of one relational table.
//!
//! A [`DataTable`] mediates every append, update, delete, scan and
//! schema-change operation against its table. It sits between query
//! execution above and row-group storage below, and coordinates with each
//! transaction's [`LocalStorage`] to provide snapshot isolation:
//!
//! - Writes land in the transaction's local store (row identifiers at or
//!   above [`MAX_ROW_ID`]) after constraint verification, and flush through
//!   the global append pipeline at commit.
//! - Constraint verification covers generated columns, NOT NULL, CHECK,
//!   UNIQUE via index probing with a [`ConflictManager`], and FOREIGN KEY
//!   across both the committed and the transaction-local store.
//! - Schema evolution constructs a successor `DataTable` under the parent's
//!   append lock and demotes the parent; writes against a demoted version
//!   fail with a transaction conflict.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod column;
pub mod conflict;
pub mod constraint;
mod constraint_validation;
pub mod data_table;
pub mod index;
pub mod local_storage;
pub mod scan;
pub mod session;
pub mod table_info;
pub mod wal;

pub use catalog::Catalog;
pub use column::{ColumnDefinition, GeneratedColumn};
pub use conflict::{ConflictManager, ConflictMode, ConflictTarget, VerifyExistenceKind};
pub use constraint::{BoundConstraint, BoundForeignKey, ForeignKeyKind};
pub use data_table::{DataTable, TableAppendState};
pub use index::{HashIndex, Index, TableIndexList, is_foreign_key_index};
pub use local_storage::{
    LocalAppendState, LocalScanState, LocalStorage, LocalTableStorage, OptimisticDataWriter,
    ParallelLocalScanState,
};
pub use scan::{CreateIndexScanState, ParallelTableScanState, TableScanState};
pub use session::{Session, SessionConfig};
pub use table_info::{DataTableInfo, TableIoManager};
pub use wal::{WalRecord, WriteAheadLog};

pub use strata_store::{
    COLUMN_IDENTIFIER_ROW_ID, MAX_ROW_ID, MemoryTableDataWriter, PersistentTableData,
    ROW_GROUP_SIZE, ROW_GROUP_VECTOR_COUNT, ROW_ID_COLUMN_NAME, RowGroupCollection, RowId,
    TableScanType, VECTOR_SIZE,
};
