use std::sync::MutexGuard;

use strata_store::{ParallelRowGroupScanState, RowGroupScanState};

use crate::local_storage::{LocalScanState, ParallelLocalScanState};

/// Cursor over one table: committed rows first, then the transaction's
/// local rows.
pub struct TableScanState {
    pub table_state: RowGroupScanState,
    pub local_state: Option<LocalScanState>,
}

impl TableScanState {
    pub fn column_ids(&self) -> &[usize] {
        self.table_state.column_ids()
    }
}

/// Shared coordinator state for a parallel scan over committed and local
/// work units.
pub struct ParallelTableScanState {
    pub scan_state: ParallelRowGroupScanState,
    pub local_state: ParallelLocalScanState,
}

/// Scan state for an index build. Holds the table's append lock so nothing
/// is appended until the scan completes.
pub struct CreateIndexScanState<'a> {
    pub(crate) _append_lock: MutexGuard<'a, ()>,
    pub scan: TableScanState,
}
