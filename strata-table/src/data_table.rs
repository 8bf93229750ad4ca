use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::array::RecordBatch;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tracing::debug;

use strata_expr::{ScalarExpr, TableFilterSet, Value};
use strata_result::{Error, Result};
use strata_store::{
    COLUMN_IDENTIFIER_ROW_ID, ColumnStats, MAX_ROW_ID, PersistentTableData,
    ROW_GROUP_VECTOR_COUNT, ROW_ID_COLUMN_NAME, RowGroupAppendState, RowGroupCollection, RowId,
    TableDataWriter, TablePointer, TableScanType, VECTOR_SIZE,
};
use strata_transaction::{Transaction, TxnId};

use crate::column::{ColumnDefinition, renumber_columns};
use crate::constraint::{BoundConstraint, BoundForeignKey, ForeignKeyKind};
use crate::index::append_to_index_list;
use crate::local_storage::{LocalAppendState, OptimisticDataWriter};
use crate::scan::{CreateIndexScanState, ParallelTableScanState, TableScanState};
use crate::session::{Session, SessionConfig};
use crate::table_info::{DataTableInfo, TableIoManager};
use crate::wal::WriteAheadLog;

/// In-flight bulk append. Holding the state holds the table's append lock,
/// which is what entitles the caller to `initialize_append` and `append`.
pub struct TableAppendState<'a> {
    _append_lock: MutexGuard<'a, ()>,
    pub row_start: u64,
    pub current_row: u64,
    store_state: Option<RowGroupAppendState>,
}

/// Physical storage of one relational table.
///
/// A `DataTable` mediates every append, update, delete, scan and
/// schema-change operation against its table, coordinating committed
/// row-group storage with the current transaction's local store. Schema
/// changes construct a successor sharing the same [`DataTableInfo`] and
/// demote this version: a non-root table refuses every write.
#[derive(Debug)]
pub struct DataTable {
    info: Arc<DataTableInfo>,
    column_definitions: Vec<ColumnDefinition>,
    constraints: Vec<BoundConstraint>,
    row_groups: Arc<RowGroupCollection>,
    physical_schema: SchemaRef,
    append_lock: Mutex<()>,
    is_root: AtomicBool,
}

fn build_physical_schema(columns: &[ColumnDefinition]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .filter(|column| !column.is_generated())
        .map(|column| column.to_field())
        .collect();
    Arc::new(Schema::new(fields))
}

impl DataTable {
    /// Create a table from persistent data (fresh open) or empty storage.
    pub fn new(
        io_manager: Arc<TableIoManager>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        mut column_definitions: Vec<ColumnDefinition>,
        constraints: Vec<BoundConstraint>,
        data: Option<PersistentTableData>,
    ) -> Result<DataTable> {
        renumber_columns(&mut column_definitions);
        let physical_schema = build_physical_schema(&column_definitions);
        let info = DataTableInfo::new(io_manager, schema_name, table_name);
        let row_groups = Arc::new(RowGroupCollection::new(
            physical_schema
                .fields()
                .iter()
                .map(|field| field.data_type().clone())
                .collect(),
        ));
        if let Some(data) = data {
            row_groups.initialize(data)?;
            info.set_cardinality(row_groups.get_total_rows());
        }
        row_groups.verify();
        let table = DataTable {
            info,
            column_definitions,
            constraints,
            row_groups,
            physical_schema,
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        };
        table.verify();
        Ok(table)
    }

    /// A successor version sharing this table's `DataTableInfo`.
    fn successor(
        &self,
        column_definitions: Vec<ColumnDefinition>,
        constraints: Vec<BoundConstraint>,
        row_groups: Arc<RowGroupCollection>,
    ) -> DataTable {
        let physical_schema = build_physical_schema(&column_definitions);
        DataTable {
            info: Arc::clone(&self.info),
            column_definitions,
            constraints,
            row_groups,
            physical_schema,
            append_lock: Mutex::new(()),
            is_root: AtomicBool::new(true),
        }
    }

    fn demote(&self) {
        self.is_root.store(false, Ordering::SeqCst);
    }

    pub fn info(&self) -> &Arc<DataTableInfo> {
        &self.info
    }

    pub fn column_definitions(&self) -> &[ColumnDefinition] {
        &self.column_definitions
    }

    pub fn constraints(&self) -> &[BoundConstraint] {
        &self.constraints
    }

    pub fn row_groups(&self) -> &Arc<RowGroupCollection> {
        &self.row_groups
    }

    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::SeqCst)
    }

    pub fn get_types(&self) -> Vec<DataType> {
        self.column_definitions
            .iter()
            .map(|column| column.data_type().clone())
            .collect()
    }

    /// Schema over the non-generated columns in storage order.
    pub fn physical_schema(&self) -> SchemaRef {
        Arc::clone(&self.physical_schema)
    }

    pub fn physical_types(&self) -> Vec<DataType> {
        self.physical_schema
            .fields()
            .iter()
            .map(|field| field.data_type().clone())
            .collect()
    }

    pub(crate) fn physical_column_count(&self) -> usize {
        self.physical_schema.fields().len()
    }

    pub(crate) fn column_by_storage(&self, storage_oid: usize) -> Option<&ColumnDefinition> {
        self.column_definitions
            .iter()
            .find(|column| column.storage_oid() == Some(storage_oid))
    }

    pub fn get_total_rows(&self) -> u64 {
        self.row_groups.get_total_rows()
    }

    //===------------------------------------------------------------===//
    // Scan
    //===------------------------------------------------------------===//

    fn projection_schema(&self, column_ids: &[usize]) -> Result<SchemaRef> {
        let mut fields = Vec::with_capacity(column_ids.len());
        for &column_id in column_ids {
            if column_id == COLUMN_IDENTIFIER_ROW_ID {
                fields.push(Field::new(ROW_ID_COLUMN_NAME, DataType::Int64, false));
                continue;
            }
            let column = self.column_by_storage(column_id).ok_or_else(|| {
                Error::Internal(format!(
                    "projection references storage column {column_id}, which does not exist"
                ))
            })?;
            fields.push(column.to_field());
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Serial scan: committed rows first, then the transaction's local rows.
    pub fn initialize_scan(
        &self,
        session: &Session,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
    ) -> Result<TableScanState> {
        let schema = self.projection_schema(&column_ids)?;
        let table_state = self.row_groups.initialize_scan(
            Arc::clone(&schema),
            column_ids.clone(),
            filters.clone(),
        );
        let local_state =
            Some(
                session
                    .local_storage()
                    .initialize_scan(self, schema, column_ids, filters),
            );
        Ok(TableScanState {
            table_state,
            local_state,
        })
    }

    /// Offset-bounded committed scan for index builds and segment scans.
    pub fn initialize_scan_with_offset(
        &self,
        column_ids: Vec<usize>,
        start_row: u64,
        end_row: u64,
    ) -> Result<TableScanState> {
        let schema = self.projection_schema(&column_ids)?;
        Ok(TableScanState {
            table_state: self.row_groups.initialize_scan_with_offset(
                schema,
                column_ids,
                start_row,
                end_row,
            ),
            local_state: None,
        })
    }

    pub fn scan(
        &self,
        session: &Session,
        state: &mut TableScanState,
    ) -> Result<Option<RecordBatch>> {
        if let Some(chunk) = self.row_groups.scan(session.txn(), &mut state.table_state)? {
            debug_assert!(chunk.num_rows() > 0);
            return Ok(Some(chunk));
        }
        match &mut state.local_state {
            Some(local_state) => session.local_storage().scan(local_state),
            None => Ok(None),
        }
    }

    /// Committed-only scan that bypasses MVCC snapshots.
    pub fn create_index_scan(
        &self,
        state: &mut TableScanState,
        scan_type: TableScanType,
    ) -> Result<Option<RecordBatch>> {
        self.row_groups.scan_committed(&mut state.table_state, scan_type)
    }

    /// Scan state for an index build; holds the append lock so nothing is
    /// appended until the scan finishes.
    pub fn initialize_create_index_scan(
        &self,
        column_ids: Vec<usize>,
    ) -> Result<CreateIndexScanState<'_>> {
        let guard = self.append_lock.lock().unwrap();
        let scan =
            self.initialize_scan_with_offset(column_ids, 0, self.row_groups.get_total_rows())?;
        Ok(CreateIndexScanState {
            _append_lock: guard,
            scan,
        })
    }

    /// Fetch committed rows by identifier.
    pub fn fetch(&self, column_ids: &[usize], row_ids: &[RowId]) -> Result<RecordBatch> {
        let schema = self.projection_schema(column_ids)?;
        self.row_groups.fetch(schema, column_ids, row_ids)
    }

    pub fn max_threads(&self, config: &SessionConfig) -> usize {
        let parallel_scan_vector_count = if config.verify_parallelism {
            1
        } else {
            ROW_GROUP_VECTOR_COUNT
        };
        let parallel_scan_tuple_count = (VECTOR_SIZE * parallel_scan_vector_count) as u64;
        (self.row_groups.get_total_rows() / parallel_scan_tuple_count + 1) as usize
    }

    pub fn initialize_parallel_scan(&self, session: &Session) -> ParallelTableScanState {
        let vector_count = if session.config().verify_parallelism {
            1
        } else {
            ROW_GROUP_VECTOR_COUNT
        };
        ParallelTableScanState {
            scan_state: self
                .row_groups
                .initialize_parallel_scan((VECTOR_SIZE * vector_count) as u64),
            local_state: session.local_storage().initialize_parallel_scan(self),
        }
    }

    /// Deliver the next work unit into `scan_state`: committed units first,
    /// then local-store units. Returns false only when both are drained.
    pub fn next_parallel_scan(
        &self,
        session: &Session,
        pstate: &mut ParallelTableScanState,
        scan_state: &mut TableScanState,
    ) -> Result<bool> {
        if self
            .row_groups
            .next_parallel_scan(&mut pstate.scan_state, &mut scan_state.table_state)
        {
            // Keep the local range empty so scanning this unit does not fall
            // through into local rows; they get their own units.
            if let Some(local_state) = scan_state.local_state.as_mut() {
                local_state.clear_range();
            }
            return Ok(true);
        }
        scan_state.table_state.batch_index = pstate.scan_state.batch_index;
        session
            .local_storage()
            .next_parallel_scan(self, &mut pstate.local_state, scan_state)
    }

    /// Stream the committed segment `[row_start, row_start + count)` in
    /// vector-sized chunks, slicing the first and last chunks when they
    /// straddle the requested range.
    pub fn scan_table_segment(
        &self,
        row_start: u64,
        count: u64,
        mut chunk_fn: impl FnMut(&RecordBatch) -> Result<()>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let end = row_start + count;
        let column_ids: Vec<usize> = (0..self.physical_column_count()).collect();
        let mut state = self.initialize_scan_with_offset(column_ids, row_start, end)?;
        let mut current_row = row_start - row_start % VECTOR_SIZE as u64;
        while current_row < end {
            let Some(chunk) = self
                .row_groups
                .scan_committed(&mut state.table_state, TableScanType::CommittedRows)?
            else {
                break;
            };
            let chunk_rows = chunk.num_rows() as u64;
            let end_row = current_row + chunk_rows;
            let chunk_start = current_row.max(row_start);
            let chunk_end = end_row.min(end);
            debug_assert!(chunk_start < chunk_end);
            let chunk_count = chunk_end - chunk_start;
            if chunk_count != chunk_rows {
                let offset = (chunk_start - current_row) as usize;
                let sliced = chunk.slice(offset, chunk_count as usize);
                chunk_fn(&sliced)?;
            } else {
                chunk_fn(&chunk)?;
            }
            current_row = end_row;
        }
        Ok(())
    }

    //===------------------------------------------------------------===//
    // Local append
    //===------------------------------------------------------------===//

    pub fn initialize_local_append(self: &Arc<Self>, session: &Session) -> Result<LocalAppendState> {
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }
        Ok(session.local_storage().initialize_append(self))
    }

    /// Verify constraints (unless `unchecked`) and insert the chunk into the
    /// transaction's local store. On any constraint error no partial row
    /// remains in the store.
    pub fn local_append(
        &self,
        state: &LocalAppendState,
        session: &Session,
        chunk: &RecordBatch,
        unchecked: bool,
    ) -> Result<()> {
        if chunk.num_rows() == 0 {
            return Ok(());
        }
        if chunk.num_columns() != self.physical_column_count() {
            return Err(Error::Internal(format!(
                "append chunk has {} columns, table stores {}",
                chunk.num_columns(),
                self.physical_column_count()
            )));
        }
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }
        if !unchecked {
            self.verify_append_constraints(session, chunk, None)?;
        }
        session.local_storage().append(state, chunk)
    }

    pub fn finalize_local_append(&self, session: &Session, state: LocalAppendState) {
        session.local_storage().finalize_append(state);
    }

    /// One-shot local append of a single chunk.
    pub fn local_append_chunk(
        table: &Arc<DataTable>,
        session: &Session,
        chunk: &RecordBatch,
    ) -> Result<()> {
        let state = table.initialize_local_append(session)?;
        let result = table.local_append(&state, session, chunk, false);
        table.finalize_local_append(session, state);
        result
    }

    /// One-shot local append of a chunk collection.
    pub fn local_append_chunks(
        table: &Arc<DataTable>,
        session: &Session,
        chunks: impl IntoIterator<Item = RecordBatch>,
    ) -> Result<()> {
        let state = table.initialize_local_append(session)?;
        for chunk in chunks {
            if let Err(error) = table.local_append(&state, session, &chunk, false) {
                table.finalize_local_append(session, state);
                return Err(error);
            }
        }
        table.finalize_local_append(session, state);
        Ok(())
    }

    pub fn create_optimistic_writer(
        self: &Arc<Self>,
        session: &Session,
    ) -> OptimisticDataWriter {
        session
            .local_storage()
            .create_optimistic_writer(self, session.txn())
    }

    pub fn local_merge(
        self: &Arc<Self>,
        session: &Session,
        collection: &RowGroupCollection,
    ) -> Result<()> {
        session.local_storage().local_merge(self, collection)
    }

    //===------------------------------------------------------------===//
    // Global append
    //===------------------------------------------------------------===//

    /// Acquire the append lock and record the append's starting row.
    pub fn append_lock(&self) -> Result<TableAppendState<'_>> {
        let guard = self.append_lock.lock().unwrap();
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "adding entries to a table that has been altered".into(),
            ));
        }
        let row_start = self.row_groups.get_total_rows();
        Ok(TableAppendState {
            _append_lock: guard,
            row_start,
            current_row: row_start,
            store_state: None,
        })
    }

    /// Reserve row-group capacity for `count` rows. Requires the append
    /// lock, which holding `state` proves.
    pub fn initialize_append(
        &self,
        txn: &Transaction,
        state: &mut TableAppendState<'_>,
        count: u64,
    ) -> Result<()> {
        state.store_state = Some(self.row_groups.initialize_append(txn, count));
        Ok(())
    }

    /// Write a chunk into the row groups without re-verifying constraints.
    pub fn append(&self, chunk: &RecordBatch, state: &mut TableAppendState<'_>) -> Result<()> {
        debug_assert!(self.is_root());
        let store_state = state.store_state.as_mut().ok_or_else(|| {
            Error::Internal("initialize_append must be called before append".into())
        })?;
        self.row_groups.append(chunk, store_state)?;
        state.current_row = store_state.current_row;
        Ok(())
    }

    /// Publish appended rows under `commit_id` and bump the cardinality.
    pub fn commit_append(&self, commit_id: TxnId, row_start: u64, count: u64) -> Result<()> {
        let _lock = self.append_lock.lock().unwrap();
        self.row_groups.commit_append(commit_id, row_start, count)?;
        self.info.add_cardinality(count);
        Ok(())
    }

    /// Undo an uncommitted append: remove the rows from every index, reset
    /// the cardinality and drop the rows from the row groups.
    pub fn revert_append(&self, start_row: u64, count: u64) -> Result<()> {
        let _lock = self.append_lock.lock().unwrap();
        if count == 0 {
            return Ok(());
        }
        if !self.info.indexes().is_empty() {
            let mut current_row_base = start_row;
            self.scan_table_segment(start_row, count, |chunk| {
                let row_ids: Vec<RowId> = (current_row_base
                    ..current_row_base + chunk.num_rows() as u64)
                    .collect();
                self.info.indexes().scan(|index| {
                    index.delete(chunk, &row_ids)?;
                    Ok(false)
                })?;
                current_row_base += chunk.num_rows() as u64;
                Ok(())
            })?;
        }
        debug_assert!(self.is_root());
        self.info.set_cardinality(start_row);
        self.row_groups.revert_append_internal(start_row, count)
    }

    /// Write the appended segment to the write-ahead log.
    pub fn write_to_log(&self, wal: &WriteAheadLog, row_start: u64, count: u64) -> Result<()> {
        if wal.skip_writing() {
            return Ok(());
        }
        wal.write_set_table(self.info.schema_name(), self.info.table_name());
        self.scan_table_segment(row_start, count, |chunk| {
            wal.write_insert(chunk.clone());
            Ok(())
        })
    }

    //===------------------------------------------------------------===//
    // Indexes
    //===------------------------------------------------------------===//

    /// Insert the chunk into every index, synthesizing row identifiers from
    /// `row_start`. On any failure every already-updated index is rolled
    /// back and the call reports failure without raising; the caller reverts
    /// the append.
    pub fn append_to_indexes(&self, chunk: &RecordBatch, row_start: RowId) -> bool {
        debug_assert!(self.is_root());
        if self.info.indexes().is_empty() {
            return true;
        }
        let row_ids: Vec<RowId> = (row_start..row_start + chunk.num_rows() as u64).collect();
        append_to_index_list(self.info.indexes(), chunk, &row_ids).is_ok()
    }

    pub fn remove_from_indexes(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert!(self.is_root());
        self.info.indexes().scan(|index| {
            index.delete(chunk, row_ids)?;
            Ok(false)
        })?;
        Ok(())
    }

    /// Remove rows from every index by identifier, fetching their key values
    /// from the row groups.
    pub fn remove_from_indexes_by_id(&self, row_ids: &[RowId]) -> Result<()> {
        if self.info.indexes().is_empty() || row_ids.is_empty() {
            return Ok(());
        }
        let column_ids: Vec<usize> = (0..self.physical_column_count()).collect();
        let chunk = self.fetch(&column_ids, row_ids)?;
        self.remove_from_indexes(&chunk, row_ids)
    }

    //===------------------------------------------------------------===//
    // Delete / Update
    //===------------------------------------------------------------===//

    /// Delete rows, routing by the identifier space of the first row id.
    /// Returns the number of rows actually deleted.
    pub fn delete(&self, session: &Session, row_ids: &[RowId]) -> Result<u64> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        let is_local = row_ids[0] >= MAX_ROW_ID;
        debug_assert!(
            row_ids.iter().all(|&id| (id >= MAX_ROW_ID) == is_local),
            "a delete batch must not mix committed and local row identifiers"
        );
        let needs_fk_verification = self.constraints.iter().any(|constraint| {
            matches!(
                constraint,
                BoundConstraint::ForeignKey(BoundForeignKey {
                    kind: ForeignKeyKind::PrimaryKeyTable | ForeignKeyKind::SelfReferenceTable,
                    ..
                })
            )
        });
        if needs_fk_verification {
            let verify_chunk = if is_local {
                session.local_storage().fetch_chunk(self, row_ids)?
            } else {
                let column_ids: Vec<usize> = (0..self.physical_column_count()).collect();
                self.fetch(&column_ids, row_ids)?
            };
            self.verify_delete_constraints(session, &verify_chunk)?;
        }
        if is_local {
            session.local_storage().delete(self, row_ids)
        } else {
            self.row_groups.delete(session.txn(), row_ids)
        }
    }

    /// Update the given physical columns of the given rows.
    ///
    /// Updates must not touch indexed columns; the planner rewrites those
    /// into delete + insert, and that contract is enforced here.
    pub fn update(
        &self,
        session: &Session,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        if column_ids.len() != updates.num_columns() {
            return Err(Error::Internal(format!(
                "update chunk has {} columns for {} column ids",
                updates.num_columns(),
                column_ids.len()
            )));
        }
        if updates.num_rows() == 0 {
            return Ok(());
        }
        if updates.num_rows() != row_ids.len() {
            return Err(Error::Internal(
                "update chunk row count does not match the row identifiers".into(),
            ));
        }
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "cannot update a table that has been altered".into(),
            ));
        }
        self.verify_update_constraints(updates, column_ids)?;
        if row_ids[0] >= MAX_ROW_ID {
            session
                .local_storage()
                .update(self, row_ids, column_ids, updates)
        } else {
            self.row_groups
                .update(session.txn(), row_ids, column_ids, updates)
        }
    }

    /// Direct single-column row-group update addressed by a column path.
    /// Used internally; performs no constraint verification.
    pub fn update_column(
        &self,
        session: &Session,
        row_ids: &[RowId],
        column_path: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        if updates.num_columns() != 1 {
            return Err(Error::Internal(
                "update_column expects a single-column chunk".into(),
            ));
        }
        if updates.num_rows() == 0 {
            return Ok(());
        }
        if !self.is_root() {
            return Err(Error::TransactionConflict(
                "cannot update a table that has been altered".into(),
            ));
        }
        self.row_groups
            .update_column(session.txn(), row_ids, column_path, updates)
    }

    //===------------------------------------------------------------===//
    // Schema evolution
    //===------------------------------------------------------------===//

    /// Construct a successor with one more column, mirroring the change into
    /// the transaction's local store and demoting `parent`.
    pub fn add_column(
        parent: &Arc<DataTable>,
        session: &Session,
        column: ColumnDefinition,
        default: Option<ScalarExpr>,
    ) -> Result<Arc<DataTable>> {
        let _parent_lock = parent.append_lock.lock().unwrap();
        let mut columns = parent.column_definitions.clone();
        columns.push(column);
        renumber_columns(&mut columns);
        let added_generated = columns.last().unwrap().is_generated();
        let added_type = columns.last().unwrap().data_type().clone();

        let row_groups = if added_generated {
            Arc::clone(&parent.row_groups)
        } else {
            Arc::new(parent.row_groups.add_column(added_type, default.as_ref())?)
        };
        let new_table = Arc::new(parent.successor(
            columns,
            parent.constraints.clone(),
            row_groups,
        ));
        if added_generated {
            session.local_storage().move_storage(parent, &new_table)?;
        } else {
            session
                .local_storage()
                .add_column(parent, &new_table, default.as_ref())?;
        }
        parent.demote();
        debug!(
            table = parent.info.table_name(),
            column = new_table.column_definitions.last().unwrap().name(),
            "added column"
        );
        Ok(new_table)
    }

    /// Construct a successor without logical column `removed`, renumbering
    /// the remaining ordinals.
    pub fn drop_column(
        parent: &Arc<DataTable>,
        session: &Session,
        removed: usize,
    ) -> Result<Arc<DataTable>> {
        let _parent_lock = parent.append_lock.lock().unwrap();
        if removed >= parent.column_definitions.len() {
            return Err(Error::Internal(format!(
                "drop_column index {removed} out of range"
            )));
        }
        let removed_storage = parent.column_definitions[removed].storage_oid();
        if let Some(storage) = removed_storage {
            parent.info.indexes().scan(|index| {
                for &column_id in index.column_ids() {
                    if column_id == storage {
                        return Err(Error::CatalogError(
                            "Cannot drop this column: an index depends on it!".into(),
                        ));
                    }
                    if column_id > storage {
                        return Err(Error::CatalogError(
                            "Cannot drop this column: an index depends on a column after it!"
                                .into(),
                        ));
                    }
                }
                Ok(false)
            })?;
            for column in &parent.column_definitions {
                if let Some(generated) = column.generated_column() {
                    let mut refs = Vec::new();
                    generated.expr.referenced_columns(&mut refs);
                    if refs.contains(&storage) {
                        return Err(Error::CatalogError(
                            "Cannot drop this column: a generated column depends on it!".into(),
                        ));
                    }
                }
            }
        }

        let mut columns = parent.column_definitions.clone();
        columns.remove(removed);
        renumber_columns(&mut columns);
        let constraints = match removed_storage {
            Some(storage) => {
                // Shift generated expressions past the removed storage slot.
                for column in &mut columns {
                    if let Some(generated) = column.generated_column_mut() {
                        generated
                            .expr
                            .remap_columns(&|idx| if idx > storage { idx - 1 } else { idx });
                    }
                }
                remap_constraints_after_drop(&parent.constraints, storage)
            }
            None => parent.constraints.clone(),
        };

        let row_groups = match removed_storage {
            Some(storage) => Arc::new(parent.row_groups.remove_column(storage)?),
            None => Arc::clone(&parent.row_groups),
        };
        let new_table = Arc::new(parent.successor(columns, constraints, row_groups));
        match removed_storage {
            Some(storage) => session
                .local_storage()
                .drop_column(parent, &new_table, storage)?,
            None => session.local_storage().move_storage(parent, &new_table)?,
        }
        parent.demote();
        debug!(table = parent.info.table_name(), removed, "dropped column");
        Ok(new_table)
    }

    /// Construct a successor with logical column `changed` converted to
    /// `target_type` through `cast_expr` over the `bound_columns` projection.
    pub fn alter_type(
        parent: &Arc<DataTable>,
        session: &Session,
        changed: usize,
        target_type: DataType,
        bound_columns: &[usize],
        cast_expr: &ScalarExpr,
    ) -> Result<Arc<DataTable>> {
        let _parent_lock = parent.append_lock.lock().unwrap();
        if changed >= parent.column_definitions.len() {
            return Err(Error::Internal(format!(
                "alter_type index {changed} out of range"
            )));
        }
        let changed_storage = parent.column_definitions[changed]
            .storage_oid()
            .ok_or_else(|| {
                Error::NotImplemented("changing the type of a generated column".into())
            })?;
        parent.info.indexes().scan(|index| {
            if index.column_ids().contains(&changed_storage) {
                return Err(Error::CatalogError(
                    "Cannot change the type of this column: an index depends on it!".into(),
                ));
            }
            Ok(false)
        })?;

        let mut columns = parent.column_definitions.clone();
        columns[changed].set_data_type(target_type.clone());
        let row_groups = Arc::new(parent.row_groups.alter_type(
            changed_storage,
            target_type,
            bound_columns,
            cast_expr,
        )?);
        let new_table = Arc::new(parent.successor(
            columns,
            parent.constraints.clone(),
            row_groups,
        ));
        session.local_storage().change_type(
            parent,
            &new_table,
            changed_storage,
            bound_columns,
            cast_expr,
        )?;
        parent.demote();
        debug!(table = parent.info.table_name(), changed, "altered column type");
        Ok(new_table)
    }

    /// Construct a successor carrying one more constraint. Only NOT NULL is
    /// supported; the constraint is verified against committed and local
    /// rows before the parent is demoted, and the successor shares the
    /// parent's row groups.
    pub fn add_constraint(
        parent: &Arc<DataTable>,
        session: &Session,
        constraint: BoundConstraint,
    ) -> Result<Arc<DataTable>> {
        let _parent_lock = parent.append_lock.lock().unwrap();
        let BoundConstraint::NotNull {
            column,
            column_name,
        } = &constraint
        else {
            return Err(Error::NotImplemented(
                "ALTER TABLE ADD CONSTRAINT only supports NOT NULL".into(),
            ));
        };
        parent.row_groups.verify_new_constraint(
            *column,
            parent.info.table_name(),
            column_name,
        )?;
        session.local_storage().verify_new_constraint(
            parent,
            *column,
            parent.info.table_name(),
            column_name,
        )?;
        let mut constraints = parent.constraints.clone();
        constraints.push(constraint.clone());
        let new_table = Arc::new(parent.successor(
            parent.column_definitions.clone(),
            constraints,
            Arc::clone(&parent.row_groups),
        ));
        session.local_storage().move_storage(parent, &new_table)?;
        parent.demote();
        debug!(table = parent.info.table_name(), "added constraint");
        Ok(new_table)
    }

    //===------------------------------------------------------------===//
    // Checkpoint and introspection
    //===------------------------------------------------------------===//

    /// Checkpoint: copy per-column statistics, write the row-group payload,
    /// then the column stats, row-group pointers and table pointer.
    pub fn checkpoint(&self, writer: &mut dyn TableDataWriter) -> Result<()> {
        let physical_count = self.physical_column_count();
        let mut global_stats = Vec::with_capacity(physical_count);
        for storage in 0..physical_count {
            global_stats.push(self.row_groups.copy_stats(storage));
        }
        self.row_groups.checkpoint(writer)?;
        writer.finalize_table(
            global_stats,
            TablePointer {
                schema: self.info.schema_name().to_string(),
                table: self.info.table_name().to_string(),
                total_rows: self.row_groups.get_total_rows(),
                index_count: self.info.indexes().count(),
            },
        )
    }

    pub fn get_statistics(&self, column_id: usize) -> Option<ColumnStats> {
        if column_id == COLUMN_IDENTIFIER_ROW_ID || column_id >= self.physical_column_count() {
            return None;
        }
        Some(self.row_groups.copy_stats(column_id))
    }

    pub fn set_statistics(&self, column_id: usize, set_fn: impl FnOnce(&mut ColumnStats)) {
        debug_assert_ne!(column_id, COLUMN_IDENTIFIER_ROW_ID);
        self.row_groups.set_statistics(column_id, set_fn);
    }

    /// Mark a dropped logical column's storage for reclamation.
    pub fn commit_drop_column(&self, column: usize) {
        if let Some(storage) = self.column_definitions[column].storage_oid() {
            self.row_groups.commit_drop_column(storage);
        }
    }

    /// Mark the table's storage for reclamation.
    pub fn commit_drop_table(&self) {
        self.row_groups.commit_drop_table();
    }

    pub fn get_storage_info(&self) -> Vec<Vec<Value>> {
        self.row_groups.get_storage_info()
    }

    /// Merge a bulk-loaded collection's row groups into this table.
    pub fn merge_storage(&self, data: &RowGroupCollection) -> Result<()> {
        self.row_groups.merge_storage(data)?;
        self.row_groups.verify();
        Ok(())
    }

    /// Internal invariant checks; compiled to nothing in release builds.
    pub fn verify(&self) {
        self.row_groups.verify();
        let mut last_storage: Option<usize> = None;
        for (position, column) in self.column_definitions.iter().enumerate() {
            debug_assert_eq!(column.oid(), position);
            match column.storage_oid() {
                Some(storage) => {
                    debug_assert!(!column.is_generated());
                    debug_assert_eq!(storage, last_storage.map_or(0, |prev| prev + 1));
                    last_storage = Some(storage);
                }
                None => debug_assert!(column.is_generated()),
            }
        }
    }
}

/// Rewrite constraints for a drop of storage column `removed`: constraints
/// on the dropped column disappear, later storage ordinals shift down.
fn remap_constraints_after_drop(
    constraints: &[BoundConstraint],
    removed: usize,
) -> Vec<BoundConstraint> {
    let shift = |idx: usize| if idx > removed { idx - 1 } else { idx };
    let mut remapped = Vec::with_capacity(constraints.len());
    for constraint in constraints {
        match constraint {
            BoundConstraint::NotNull {
                column,
                column_name,
            } => {
                if *column == removed {
                    continue;
                }
                remapped.push(BoundConstraint::NotNull {
                    column: shift(*column),
                    column_name: column_name.clone(),
                });
            }
            BoundConstraint::Check {
                expr,
                bound_columns,
            } => {
                if bound_columns.contains(&removed) {
                    continue;
                }
                let mut expr = expr.clone();
                expr.remap_columns(&shift);
                remapped.push(BoundConstraint::check(expr));
            }
            BoundConstraint::Unique { columns } => {
                if columns.contains(&removed) {
                    continue;
                }
                remapped.push(BoundConstraint::Unique {
                    columns: columns.iter().map(|&idx| shift(idx)).collect(),
                });
            }
            BoundConstraint::ForeignKey(fk) => {
                let own_fk_side = matches!(
                    fk.kind,
                    ForeignKeyKind::ForeignKeyTable | ForeignKeyKind::SelfReferenceTable
                );
                let own_pk_side = matches!(
                    fk.kind,
                    ForeignKeyKind::PrimaryKeyTable | ForeignKeyKind::SelfReferenceTable
                );
                if (own_fk_side && fk.fk_keys.contains(&removed))
                    || (own_pk_side && fk.pk_keys.contains(&removed))
                {
                    continue;
                }
                let mut fk = fk.clone();
                if own_fk_side {
                    fk.fk_keys = fk.fk_keys.iter().map(|&idx| shift(idx)).collect();
                }
                if own_pk_side {
                    fk.pk_keys = fk.pk_keys.iter().map(|&idx| shift(idx)).collect();
                }
                remapped.push(BoundConstraint::ForeignKey(fk));
            }
        }
    }
    remapped
}
