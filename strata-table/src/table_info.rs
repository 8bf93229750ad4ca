use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::index::TableIndexList;

/// Handle to the I/O manager responsible for a table's block storage.
///
/// The in-memory engine only distinguishes temporary from durable tables;
/// the handle exists so every table version shares one identity with its
/// storage manager.
#[derive(Debug)]
pub struct TableIoManager {
    temporary: bool,
}

impl TableIoManager {
    pub fn new(temporary: bool) -> Arc<TableIoManager> {
        Arc::new(TableIoManager { temporary })
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

/// State shared by every version of one table.
///
/// Schema changes construct successor `DataTable`s that keep pointing at the
/// same `DataTableInfo`: the index list and the cardinality counter outlive
/// any individual table version.
#[derive(Debug)]
pub struct DataTableInfo {
    schema: String,
    table: String,
    io_manager: Arc<TableIoManager>,
    indexes: TableIndexList,
    /// Committed row count; only commit and revert paths move it.
    cardinality: AtomicU64,
}

impl DataTableInfo {
    pub fn new(
        io_manager: Arc<TableIoManager>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Arc<DataTableInfo> {
        Arc::new(DataTableInfo {
            schema: schema.into(),
            table: table.into(),
            io_manager,
            indexes: TableIndexList::default(),
            cardinality: AtomicU64::new(0),
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn io_manager(&self) -> &Arc<TableIoManager> {
        &self.io_manager
    }

    pub fn is_temporary(&self) -> bool {
        self.io_manager.is_temporary()
    }

    pub fn indexes(&self) -> &TableIndexList {
        &self.indexes
    }

    pub fn cardinality(&self) -> u64 {
        self.cardinality.load(Ordering::SeqCst)
    }

    pub(crate) fn add_cardinality(&self, count: u64) {
        self.cardinality.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn set_cardinality(&self, count: u64) {
        self.cardinality.store(count, Ordering::SeqCst);
    }
}
