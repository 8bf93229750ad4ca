use std::sync::RwLock;

use arrow::array::RecordBatch;
use arrow::datatypes::{DataType, SchemaRef};
use rustc_hash::FxHashSet;
use tracing::debug;

use strata_expr::{ScalarExpr, TableFilterSet, Value, convert};
use strata_result::{Error, Result};
use strata_transaction::{TXN_ID_BOOTSTRAP, TXN_ID_NONE, Transaction, TxnId};

use crate::checkpoint::{RowGroupPointer, TableDataWriter};
use crate::row_group::RowGroup;
use crate::scan::{ParallelRowGroupScanState, RowGroupScanState, TableScanType};
use crate::stats::ColumnStats;
use crate::types::{COLUMN_IDENTIFIER_ROW_ID, ROW_GROUP_SIZE, RowId, VECTOR_SIZE};

/// Checkpointed table payload used to reopen a collection.
#[derive(Debug, Default)]
pub struct PersistentTableData {
    pub batches: Vec<RecordBatch>,
}

/// In-flight global append: rows written so far carry the appending
/// transaction's id until `commit_append` publishes them.
#[derive(Debug)]
pub struct RowGroupAppendState {
    pub(crate) txn_id: TxnId,
    pub current_row: u64,
}

struct CollectionInner {
    row_groups: Vec<RowGroup>,
    total_rows: u64,
    stats: Vec<ColumnStats>,
    dropped_columns: FxHashSet<usize>,
    dropped: bool,
}

impl CollectionInner {
    #[inline]
    fn row(&self, row: u64) -> (&RowGroup, usize) {
        let group = &self.row_groups[(row / ROW_GROUP_SIZE as u64) as usize];
        (group, (row % ROW_GROUP_SIZE as u64) as usize)
    }

    #[inline]
    fn row_mut(&mut self, row: u64) -> (&mut RowGroup, usize) {
        let group = &mut self.row_groups[(row / ROW_GROUP_SIZE as u64) as usize];
        (group, (row % ROW_GROUP_SIZE as u64) as usize)
    }

    fn open_group(&mut self, width: usize) -> &mut RowGroup {
        if self
            .row_groups
            .last()
            .map(|group| group.is_full())
            .unwrap_or(true)
        {
            let start = self.row_groups.len() as u64 * ROW_GROUP_SIZE as u64;
            self.row_groups.push(RowGroup::new(start, width));
        }
        self.row_groups.last_mut().unwrap()
    }

    fn note_row(&mut self, values: &[Value]) {
        for (stats, value) in self.stats.iter_mut().zip(values) {
            stats.update(value);
        }
        self.total_rows += 1;
    }

    /// Append a freshly written row carrying no deletion stamp.
    fn push_fresh_row(&mut self, width: usize, values: &[Value], created: TxnId) {
        self.open_group(width).append_row(values, created);
        self.note_row(values);
    }

    /// Append a row preserving existing MVCC stamps (storage merges).
    fn push_row(&mut self, width: usize, values: &[Value], created: TxnId, deleted: TxnId) {
        self.open_group(width).append_stamped_row(values, created, deleted);
        self.note_row(values);
    }

    fn recompute_stats(&mut self) {
        for stats in &mut self.stats {
            stats.reset();
        }
        for group in &self.row_groups {
            for (column, stats) in group.columns.iter().zip(self.stats.iter_mut()) {
                for value in column {
                    stats.update(value);
                }
            }
        }
    }
}

/// Columnar storage for the committed rows of one table.
///
/// All operations synchronize internally; the caller's append lock orders
/// bulk appends, reverts and schema changes above this layer.
pub struct RowGroupCollection {
    types: Vec<DataType>,
    inner: RwLock<CollectionInner>,
}

impl std::fmt::Debug for RowGroupCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowGroupCollection")
            .field("types", &self.types)
            .finish()
    }
}

impl RowGroupCollection {
    pub fn new(types: Vec<DataType>) -> RowGroupCollection {
        let stats = types.iter().map(|_| ColumnStats::default()).collect();
        RowGroupCollection {
            types,
            inner: RwLock::new(CollectionInner {
                row_groups: Vec::new(),
                total_rows: 0,
                stats,
                dropped_columns: FxHashSet::default(),
                dropped: false,
            }),
        }
    }

    /// Load checkpointed rows into an empty collection. Loaded rows belong
    /// to the bootstrap transaction and are visible to every snapshot.
    pub fn initialize(&self, data: PersistentTableData) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.total_rows != 0 {
            return Err(Error::Internal(
                "initialize called on a non-empty row-group collection".into(),
            ));
        }
        let width = self.types.len();
        for batch in &data.batches {
            if batch.num_columns() != width {
                return Err(Error::Internal(format!(
                    "persistent batch has {} columns, table stores {width}",
                    batch.num_columns()
                )));
            }
            for row in convert::batch_rows(batch)? {
                inner.push_fresh_row(width, &row, TXN_ID_BOOTSTRAP);
            }
        }
        Ok(())
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn get_total_rows(&self) -> u64 {
        self.inner.read().unwrap().total_rows
    }

    //===------------------------------------------------------------===//
    // Scan
    //===------------------------------------------------------------===//

    pub fn initialize_scan(
        &self,
        schema: SchemaRef,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
    ) -> RowGroupScanState {
        let mut state = RowGroupScanState::new(schema, column_ids, filters);
        state.max_row = self.get_total_rows();
        state
    }

    /// Bounded scan for index builds and segment scans. The start is aligned
    /// down to a vector boundary; the caller slices the leading chunk.
    pub fn initialize_scan_with_offset(
        &self,
        schema: SchemaRef,
        column_ids: Vec<usize>,
        start_row: u64,
        end_row: u64,
    ) -> RowGroupScanState {
        let mut state = RowGroupScanState::new(schema, column_ids, None);
        state.next_row = start_row - start_row % VECTOR_SIZE as u64;
        state.max_row = end_row;
        state
    }

    pub fn initialize_parallel_scan(&self, unit_rows: u64) -> ParallelRowGroupScanState {
        ParallelRowGroupScanState {
            next_row: 0,
            max_row: self.get_total_rows(),
            unit_rows,
            batch_index: 0,
        }
    }

    /// Hand the next committed work unit to `state`. Returns false when no
    /// committed units remain.
    pub fn next_parallel_scan(
        &self,
        pstate: &mut ParallelRowGroupScanState,
        state: &mut RowGroupScanState,
    ) -> bool {
        if pstate.next_row >= pstate.max_row {
            return false;
        }
        state.next_row = pstate.next_row;
        state.max_row = (pstate.next_row + pstate.unit_rows).min(pstate.max_row);
        state.batch_index = pstate.batch_index;
        pstate.next_row = state.max_row;
        pstate.batch_index += 1;
        true
    }

    /// Produce the next chunk of rows visible to `txn`, or `None` when the
    /// scan range is exhausted.
    pub fn scan(
        &self,
        txn: &Transaction,
        state: &mut RowGroupScanState,
    ) -> Result<Option<RecordBatch>> {
        let snapshot = txn.snapshot();
        let manager = txn.manager().clone();
        self.scan_filtered(state, |_, created, deleted| {
            manager.row_visible(&snapshot, created, deleted)
        })
    }

    /// Committed-only scan that bypasses MVCC snapshots.
    pub fn scan_committed(
        &self,
        state: &mut RowGroupScanState,
        scan_type: TableScanType,
    ) -> Result<Option<RecordBatch>> {
        self.scan_filtered(state, |_, _, deleted| match scan_type {
            TableScanType::CommittedRows => true,
            TableScanType::CommittedRowsOmitDeleted => deleted == TXN_ID_NONE,
        })
    }

    fn scan_filtered(
        &self,
        state: &mut RowGroupScanState,
        visible: impl Fn(u64, TxnId, TxnId) -> bool,
    ) -> Result<Option<RecordBatch>> {
        let inner = self.inner.read().unwrap();
        let limit = state.max_row.min(inner.total_rows);
        while state.next_row < limit {
            let vector_end =
                (state.next_row - state.next_row % VECTOR_SIZE as u64) + VECTOR_SIZE as u64;
            let window_end = vector_end.min(limit);

            let mut columns: Vec<Vec<Value>> = vec![Vec::new(); state.column_ids.len()];
            let mut count = 0usize;
            for row in state.next_row..window_end {
                let (group, offset) = inner.row(row);
                if !visible(row, group.created_by[offset], group.deleted_by[offset]) {
                    continue;
                }
                let mut projected = Vec::with_capacity(state.column_ids.len());
                for &column_id in &state.column_ids {
                    if column_id == COLUMN_IDENTIFIER_ROW_ID {
                        projected.push(Value::Int(row as i64));
                    } else {
                        projected.push(group.columns[column_id][offset].clone());
                    }
                }
                if let Some(filters) = &state.filters {
                    if !filters.row_matches(&projected) {
                        continue;
                    }
                }
                for (column, value) in columns.iter_mut().zip(projected) {
                    column.push(value);
                }
                count += 1;
            }
            state.next_row = window_end;
            if count > 0 {
                let batch = convert::columns_to_batch(state.schema.clone(), &columns, count)?;
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    /// Raw fetch by row identifier: no visibility filtering. Callers decide
    /// what the fetched stamps mean.
    pub fn fetch(
        &self,
        schema: SchemaRef,
        column_ids: &[usize],
        row_ids: &[RowId],
    ) -> Result<RecordBatch> {
        let inner = self.inner.read().unwrap();
        let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(row_ids.len()); column_ids.len()];
        for &row in row_ids {
            if row >= inner.total_rows {
                return Err(Error::InvalidArgumentError(format!(
                    "row identifier {row} is out of range (total rows {})",
                    inner.total_rows
                )));
            }
            let (group, offset) = inner.row(row);
            for (slot, &column_id) in columns.iter_mut().zip(column_ids) {
                if column_id == COLUMN_IDENTIFIER_ROW_ID {
                    slot.push(Value::Int(row as i64));
                } else {
                    slot.push(group.columns[column_id][offset].clone());
                }
            }
        }
        convert::columns_to_batch(schema, &columns, row_ids.len())
    }

    //===------------------------------------------------------------===//
    // Append
    //===------------------------------------------------------------===//

    pub fn initialize_append(&self, txn: &Transaction, count_hint: u64) -> RowGroupAppendState {
        let mut inner = self.inner.write().unwrap();
        if let Some(group) = inner.row_groups.last_mut() {
            let reserve = (count_hint as usize).min(ROW_GROUP_SIZE - group.len());
            for column in &mut group.columns {
                column.reserve(reserve);
            }
        }
        RowGroupAppendState {
            txn_id: txn.id(),
            current_row: inner.total_rows,
        }
    }

    /// Write a chunk. Rows carry the appending transaction's id until
    /// `commit_append` publishes them.
    pub fn append(&self, chunk: &RecordBatch, state: &mut RowGroupAppendState) -> Result<()> {
        let width = self.types.len();
        if chunk.num_columns() != width {
            return Err(Error::Internal(format!(
                "append chunk has {} columns, table stores {width}",
                chunk.num_columns()
            )));
        }
        let rows = convert::batch_rows(chunk)?;
        let mut inner = self.inner.write().unwrap();
        if inner.total_rows != state.current_row {
            return Err(Error::Internal(
                "append state is out of sync with the row-group collection".into(),
            ));
        }
        for row in &rows {
            inner.push_fresh_row(width, row, state.txn_id);
        }
        state.current_row += rows.len() as u64;
        Ok(())
    }

    /// Publish appended rows under `commit_id`.
    pub fn commit_append(&self, commit_id: TxnId, row_start: u64, count: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if row_start + count > inner.total_rows {
            return Err(Error::Internal(format!(
                "commit_append range [{row_start}, {}) exceeds total rows {}",
                row_start + count,
                inner.total_rows
            )));
        }
        for row in row_start..row_start + count {
            let (group, offset) = inner.row_mut(row);
            group.created_by[offset] = commit_id;
        }
        debug!(commit_id, row_start, count, "published append");
        Ok(())
    }

    /// Drop rows `[row_start, row_start + count)` appended by an aborted
    /// operation. They must be the physical tail of the collection.
    pub fn revert_append_internal(&self, row_start: u64, count: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if row_start + count != inner.total_rows {
            return Err(Error::Internal(format!(
                "revert_append range [{row_start}, {}) is not the tail of the collection \
                 (total rows {})",
                row_start + count,
                inner.total_rows
            )));
        }
        while inner
            .row_groups
            .last()
            .is_some_and(|group| group.start >= row_start)
        {
            inner.row_groups.pop();
        }
        if let Some(group) = inner.row_groups.last_mut() {
            let keep = (row_start - group.start) as usize;
            group.truncate(keep);
        }
        inner.total_rows = row_start;
        inner.recompute_stats();
        debug!(row_start, count, "reverted append");
        Ok(())
    }

    //===------------------------------------------------------------===//
    // Update / Delete
    //===------------------------------------------------------------===//

    /// In-place update of the given storage columns. Rows must be visible to
    /// the updating transaction; a row changed underneath it is a conflict.
    pub fn update(
        &self,
        txn: &Transaction,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        if updates.num_columns() != column_ids.len() {
            return Err(Error::Internal(format!(
                "update chunk has {} columns for {} column ids",
                updates.num_columns(),
                column_ids.len()
            )));
        }
        let rows = convert::batch_rows(updates)?;
        if rows.len() != row_ids.len() {
            return Err(Error::Internal(
                "update chunk row count does not match the row identifiers".into(),
            ));
        }
        let snapshot = txn.snapshot();
        let manager = txn.manager().clone();
        let mut inner = self.inner.write().unwrap();
        for (&row, values) in row_ids.iter().zip(&rows) {
            if row >= inner.total_rows {
                return Err(Error::InvalidArgumentError(format!(
                    "row identifier {row} is out of range"
                )));
            }
            let (group, offset) = inner.row_mut(row);
            if !manager.row_visible(&snapshot, group.created_by[offset], group.deleted_by[offset]) {
                return Err(Error::TransactionConflict(
                    "cannot update a row that was modified by a concurrent transaction".into(),
                ));
            }
            for (&column_id, value) in column_ids.iter().zip(values) {
                group.columns[column_id][offset] = value.clone();
            }
        }
        // Min/max grow monotonically; fold the new values in.
        for (position, &column_id) in column_ids.iter().enumerate() {
            for values in &rows {
                inner.stats[column_id].update(&values[position]);
            }
        }
        Ok(())
    }

    /// Single-column update addressed by a column path (used internally, no
    /// constraint verification). Only top-level columns are addressable.
    pub fn update_column(
        &self,
        txn: &Transaction,
        row_ids: &[RowId],
        column_path: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        let [column_id] = column_path else {
            return Err(Error::NotImplemented(
                "nested column updates are not supported".into(),
            ));
        };
        if updates.num_columns() != 1 {
            return Err(Error::Internal(
                "update_column expects a single-column chunk".into(),
            ));
        }
        self.update(txn, row_ids, &[*column_id], updates)
    }

    /// Stamp rows deleted by `txn`. Returns the number of rows actually
    /// deleted: rows already invisible to the transaction are skipped.
    pub fn delete(&self, txn: &Transaction, row_ids: &[RowId]) -> Result<u64> {
        let snapshot = txn.snapshot();
        let manager = txn.manager().clone();
        let mut inner = self.inner.write().unwrap();
        let mut deleted = 0u64;
        for &row in row_ids {
            if row >= inner.total_rows {
                return Err(Error::InvalidArgumentError(format!(
                    "row identifier {row} is out of range"
                )));
            }
            let (group, offset) = inner.row_mut(row);
            if !manager.row_visible(&snapshot, group.created_by[offset], group.deleted_by[offset]) {
                continue;
            }
            group.deleted_by[offset] = snapshot.txn_id;
            deleted += 1;
        }
        Ok(deleted)
    }

    //===------------------------------------------------------------===//
    // Schema changes
    //===------------------------------------------------------------===//

    /// Produce a collection with one more column, filled from the default
    /// expression (NULL when absent) for every existing row.
    pub fn add_column(
        &self,
        data_type: DataType,
        default: Option<&ScalarExpr>,
    ) -> Result<RowGroupCollection> {
        let inner = self.inner.read().unwrap();
        let mut types = self.types.clone();
        types.push(data_type);
        let new = RowGroupCollection::new(types);
        {
            let mut new_inner = new.inner.write().unwrap();
            for group in &inner.row_groups {
                let mut new_group = group.clone();
                let mut column = Vec::with_capacity(group.len());
                for offset in 0..group.len() {
                    let row: Vec<Value> = group
                        .columns
                        .iter()
                        .map(|values| values[offset].clone())
                        .collect();
                    let value = match default {
                        Some(expr) => expr.eval(&row)?,
                        None => Value::Null,
                    };
                    new_inner.stats.last_mut().unwrap().update(&value);
                    column.push(value);
                }
                new_group.columns.push(column);
                new_inner.row_groups.push(new_group);
            }
            new_inner.total_rows = inner.total_rows;
            let width = inner.stats.len();
            new_inner.stats[..width].clone_from_slice(&inner.stats);
        }
        Ok(new)
    }

    /// Produce a collection without storage column `idx`.
    pub fn remove_column(&self, idx: usize) -> Result<RowGroupCollection> {
        if idx >= self.types.len() {
            return Err(Error::Internal(format!(
                "remove_column index {idx} out of range"
            )));
        }
        let inner = self.inner.read().unwrap();
        let mut types = self.types.clone();
        types.remove(idx);
        let new = RowGroupCollection::new(types);
        {
            let mut new_inner = new.inner.write().unwrap();
            for group in &inner.row_groups {
                let mut new_group = group.clone();
                new_group.columns.remove(idx);
                new_inner.row_groups.push(new_group);
            }
            new_inner.total_rows = inner.total_rows;
            let mut stats = inner.stats.clone();
            stats.remove(idx);
            new_inner.stats = stats;
        }
        Ok(new)
    }

    /// Produce a collection with storage column `idx` converted to
    /// `new_type`. The cast expression is evaluated against the
    /// `bound_columns` projection of each row.
    pub fn alter_type(
        &self,
        idx: usize,
        new_type: DataType,
        bound_columns: &[usize],
        cast_expr: &ScalarExpr,
    ) -> Result<RowGroupCollection> {
        if idx >= self.types.len() {
            return Err(Error::Internal(format!(
                "alter_type index {idx} out of range"
            )));
        }
        let inner = self.inner.read().unwrap();
        let mut types = self.types.clone();
        types[idx] = new_type.clone();
        let new = RowGroupCollection::new(types);
        {
            let mut new_inner = new.inner.write().unwrap();
            for group in &inner.row_groups {
                let mut new_group = group.clone();
                let mut column = Vec::with_capacity(group.len());
                for offset in 0..group.len() {
                    let input: Vec<Value> = bound_columns
                        .iter()
                        .map(|&bound| group.columns[bound][offset].clone())
                        .collect();
                    let value = cast_expr.eval(&input)?;
                    if let Some(dt) = value.data_type() {
                        if dt != new_type {
                            return Err(Error::Internal(format!(
                                "cast produced {dt:?}, expected {new_type:?}"
                            )));
                        }
                    }
                    new_inner.stats[idx].update(&value);
                    column.push(value);
                }
                new_group.columns[idx] = column;
                new_inner.row_groups.push(new_group);
            }
            new_inner.total_rows = inner.total_rows;
            for (position, stats) in inner.stats.iter().enumerate() {
                if position != idx {
                    new_inner.stats[position] = stats.clone();
                }
            }
        }
        Ok(new)
    }

    /// Check a new NOT NULL constraint against every stored row that is not
    /// deleted.
    pub fn verify_new_constraint(
        &self,
        column: usize,
        table_name: &str,
        column_name: &str,
    ) -> Result<()> {
        let inner = self.inner.read().unwrap();
        for group in &inner.row_groups {
            for offset in 0..group.len() {
                if group.deleted_by[offset] != TXN_ID_NONE {
                    continue;
                }
                if group.columns[column][offset].is_null() {
                    return Err(Error::ConstraintError(format!(
                        "NOT NULL constraint failed: {table_name}.{column_name}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Merge another collection's rows into this one, preserving their MVCC
    /// stamps. Row identifiers are rebased onto this collection's tail.
    pub fn merge_storage(&self, other: &RowGroupCollection) -> Result<()> {
        if other.types != self.types {
            return Err(Error::Internal(
                "cannot merge storage with a different column layout".into(),
            ));
        }
        let other_inner = other.inner.read().unwrap();
        let mut inner = self.inner.write().unwrap();
        let width = self.types.len();
        for group in &other_inner.row_groups {
            for offset in 0..group.len() {
                let row: Vec<Value> = group
                    .columns
                    .iter()
                    .map(|values| values[offset].clone())
                    .collect();
                inner.push_row(
                    width,
                    &row,
                    group.created_by[offset],
                    group.deleted_by[offset],
                );
            }
        }
        Ok(())
    }

    //===------------------------------------------------------------===//
    // Checkpoint and introspection
    //===------------------------------------------------------------===//

    pub fn checkpoint(&self, writer: &mut dyn TableDataWriter) -> Result<()> {
        let inner = self.inner.read().unwrap();
        for group in &inner.row_groups {
            writer.write_row_group(RowGroupPointer {
                row_start: group.start,
                count: group.len() as u64,
            })?;
        }
        Ok(())
    }

    pub fn copy_stats(&self, column: usize) -> ColumnStats {
        self.inner.read().unwrap().stats[column].clone()
    }

    pub fn set_statistics(&self, column: usize, set_fn: impl FnOnce(&mut ColumnStats)) {
        set_fn(&mut self.inner.write().unwrap().stats[column]);
    }

    /// Mark a dropped column's storage for reclamation. The in-memory
    /// structure is unaffected.
    pub fn commit_drop_column(&self, column: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.dropped_columns.insert(column);
        debug!(column, "column storage marked for reclamation");
    }

    /// Mark the whole table's storage for reclamation.
    pub fn commit_drop_table(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.dropped = true;
        debug!("table storage marked for reclamation");
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.read().unwrap().dropped
    }

    /// One row per row group: [group index, row start, count, deleted count].
    pub fn get_storage_info(&self) -> Vec<Vec<Value>> {
        let inner = self.inner.read().unwrap();
        inner
            .row_groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let deleted = group
                    .deleted_by
                    .iter()
                    .filter(|&&stamp| stamp != TXN_ID_NONE)
                    .count();
                vec![
                    Value::Int(index as i64),
                    Value::Int(group.start as i64),
                    Value::Int(group.len() as i64),
                    Value::Int(deleted as i64),
                ]
            })
            .collect()
    }

    /// Internal invariant checks; compiled to nothing in release builds.
    pub fn verify(&self) {
        let inner = self.inner.read().unwrap();
        let mut expected_start = 0u64;
        let mut counted = 0u64;
        for group in &inner.row_groups {
            group.check_invariants();
            debug_assert_eq!(group.start, expected_start);
            debug_assert_eq!(group.columns.len(), self.types.len());
            expected_start += ROW_GROUP_SIZE as u64;
            counted += group.len() as u64;
        }
        debug_assert_eq!(counted, inner.total_rows);
    }
}
