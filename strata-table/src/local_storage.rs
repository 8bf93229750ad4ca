use std::sync::{Arc, Mutex};

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use rustc_hash::FxHashMap;
use tracing::debug;

use strata_expr::{ScalarExpr, TableFilterSet, Value, convert};
use strata_result::{Error, Result};
use strata_store::{
    COLUMN_IDENTIFIER_ROW_ID, MAX_ROW_ID, RowGroupAppendState, RowGroupCollection, RowId,
    TableScanType, VECTOR_SIZE,
};
use strata_transaction::{Transaction, TxnId};

use crate::data_table::DataTable;
use crate::index::{HashIndex, Index, TableIndexList, append_to_index_list};
use crate::wal::WriteAheadLog;

/// One uncommitted row. Deletion only flags the row so that local row
/// identifiers (positions) stay stable for the transaction's lifetime.
#[derive(Clone, Debug)]
struct LocalRow {
    values: Vec<Value>,
    deleted: bool,
}

/// Uncommitted rows of one table, visible only to the owning transaction.
///
/// Local row identifiers are `MAX_ROW_ID + position`. The entry mirrors the
/// table's index list so uniqueness and foreign keys can be checked against
/// uncommitted data.
pub struct LocalTableStorage {
    table: Arc<DataTable>,
    rows: Mutex<Vec<LocalRow>>,
    indexes: TableIndexList,
}

impl LocalTableStorage {
    fn new(table: Arc<DataTable>) -> Arc<LocalTableStorage> {
        let indexes = TableIndexList::default();
        for index in table.info().indexes().snapshot() {
            indexes.add(Arc::new(HashIndex::new(
                index.name(),
                index.column_ids().to_vec(),
                index.is_unique(),
                index.is_foreign(),
            )) as Arc<dyn Index>);
        }
        Arc::new(LocalTableStorage {
            table,
            rows: Mutex::new(Vec::new()),
            indexes,
        })
    }

    /// Rebuild an entry for a successor table version, re-inserting the
    /// surviving rows into fresh mirror indexes.
    fn rebuild(table: Arc<DataTable>, rows: Vec<LocalRow>) -> Result<Arc<LocalTableStorage>> {
        let entry = LocalTableStorage::new(table);
        {
            let live: Vec<(usize, &LocalRow)> = rows
                .iter()
                .enumerate()
                .filter(|(_, row)| !row.deleted)
                .collect();
            if !live.is_empty() {
                let schema = entry.table.physical_schema();
                let values: Vec<Vec<Value>> =
                    live.iter().map(|(_, row)| row.values.clone()).collect();
                let ids: Vec<RowId> = live
                    .iter()
                    .map(|(position, _)| MAX_ROW_ID + *position as u64)
                    .collect();
                let chunk = convert::rows_to_batch(schema, &values)?;
                append_to_index_list(&entry.indexes, &chunk, &ids)?;
            }
        }
        *entry.rows.lock().unwrap() = rows;
        Ok(entry)
    }

    pub fn table(&self) -> &Arc<DataTable> {
        &self.table
    }

    pub fn indexes(&self) -> &TableIndexList {
        &self.indexes
    }

    /// Number of rows the transaction would commit.
    pub fn row_count(&self) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| !row.deleted)
            .count()
    }

    /// Surviving rows chunked for the global append pipeline.
    fn commit_chunks(&self) -> Result<Vec<RecordBatch>> {
        let schema = self.table.physical_schema();
        let rows = self.rows.lock().unwrap();
        let mut chunks = Vec::new();
        let mut buffer: Vec<Vec<Value>> = Vec::with_capacity(VECTOR_SIZE);
        for row in rows.iter().filter(|row| !row.deleted) {
            buffer.push(row.values.clone());
            if buffer.len() == VECTOR_SIZE {
                chunks.push(convert::rows_to_batch(schema.clone(), &buffer)?);
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            chunks.push(convert::rows_to_batch(schema.clone(), &buffer)?);
        }
        Ok(chunks)
    }
}

/// Open appender onto one table's local rows.
pub struct LocalAppendState {
    pub(crate) entry: Arc<LocalTableStorage>,
}

/// Cursor over a table's local rows; resolved against the session's local
/// storage at scan time so it stays valid when no local data exists yet.
pub struct LocalScanState {
    pub(crate) table_key: usize,
    pub(crate) schema: SchemaRef,
    pub(crate) column_ids: Vec<usize>,
    pub(crate) filters: Option<TableFilterSet>,
    pub(crate) next_row: usize,
    pub(crate) max_row: usize,
    pub batch_index: u64,
}

impl LocalScanState {
    /// Empty the scan range; parallel committed units use this so a unit
    /// scan never falls through into local rows.
    pub(crate) fn clear_range(&mut self) {
        self.next_row = 0;
        self.max_row = 0;
    }
}

/// Coordinator state handing out local-store work units.
#[derive(Debug, Default)]
pub struct ParallelLocalScanState {
    next_chunk: usize,
}

fn table_key(table: &DataTable) -> usize {
    std::ptr::from_ref(table) as *const () as usize
}

fn local_position(row_id: RowId, row_count: usize) -> Result<usize> {
    if row_id < MAX_ROW_ID {
        return Err(Error::Internal(format!(
            "row identifier {row_id} is not transaction-local"
        )));
    }
    let position = (row_id - MAX_ROW_ID) as usize;
    if position >= row_count {
        return Err(Error::InvalidArgumentError(format!(
            "local row identifier {row_id} is out of range"
        )));
    }
    Ok(position)
}

/// Per-transaction container for uncommitted data, keyed by table identity.
#[derive(Default)]
pub struct LocalStorage {
    tables: Mutex<FxHashMap<usize, Arc<LocalTableStorage>>>,
}

impl LocalStorage {
    fn entry_or_create(&self, table: &Arc<DataTable>) -> Arc<LocalTableStorage> {
        self.tables
            .lock()
            .unwrap()
            .entry(table_key(table))
            .or_insert_with(|| LocalTableStorage::new(Arc::clone(table)))
            .clone()
    }

    fn take_entry(&self, table: &DataTable) -> Option<Arc<LocalTableStorage>> {
        self.tables.lock().unwrap().remove(&table_key(table))
    }

    fn find_by_key(&self, key: usize) -> Option<Arc<LocalTableStorage>> {
        self.tables.lock().unwrap().get(&key).cloned()
    }

    /// The entry for `table`, if this transaction holds local data for it.
    pub fn find(&self, table: &DataTable) -> Option<Arc<LocalTableStorage>> {
        self.find_by_key(table_key(table))
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.lock().unwrap();
        tables.values().all(|entry| entry.row_count() == 0)
    }

    //===------------------------------------------------------------===//
    // Append
    //===------------------------------------------------------------===//

    pub fn initialize_append(&self, table: &Arc<DataTable>) -> LocalAppendState {
        LocalAppendState {
            entry: self.entry_or_create(table),
        }
    }

    /// Insert a verified chunk. Index insertion happens before the rows are
    /// stored, so a failed insertion leaves no partial row behind.
    pub fn append(&self, state: &LocalAppendState, chunk: &RecordBatch) -> Result<()> {
        Self::append_chunk_to_entry(&state.entry, chunk)
    }

    fn append_chunk_to_entry(entry: &Arc<LocalTableStorage>, chunk: &RecordBatch) -> Result<()> {
        let row_values = convert::batch_rows(chunk)?;
        let mut rows = entry.rows.lock().unwrap();
        let start = rows.len();
        let ids: Vec<RowId> = (0..row_values.len())
            .map(|offset| MAX_ROW_ID + (start + offset) as u64)
            .collect();
        append_to_index_list(&entry.indexes, chunk, &ids)?;
        for values in row_values {
            rows.push(LocalRow {
                values,
                deleted: false,
            });
        }
        Ok(())
    }

    pub fn finalize_append(&self, state: LocalAppendState) {
        drop(state);
    }

    //===------------------------------------------------------------===//
    // Scan
    //===------------------------------------------------------------===//

    pub fn initialize_scan(
        &self,
        table: &DataTable,
        schema: SchemaRef,
        column_ids: Vec<usize>,
        filters: Option<TableFilterSet>,
    ) -> LocalScanState {
        LocalScanState {
            table_key: table_key(table),
            schema,
            column_ids,
            filters,
            next_row: 0,
            max_row: usize::MAX,
            batch_index: 0,
        }
    }

    /// Produce the next chunk of local rows, or `None` when exhausted.
    pub fn scan(&self, state: &mut LocalScanState) -> Result<Option<RecordBatch>> {
        let Some(entry) = self.find_by_key(state.table_key) else {
            return Ok(None);
        };
        let rows = entry.rows.lock().unwrap();
        let limit = state.max_row.min(rows.len());
        while state.next_row < limit {
            let window_end = (state.next_row + VECTOR_SIZE).min(limit);
            let mut columns: Vec<Vec<Value>> = vec![Vec::new(); state.column_ids.len()];
            let mut count = 0usize;
            for position in state.next_row..window_end {
                let row = &rows[position];
                if row.deleted {
                    continue;
                }
                let mut projected = Vec::with_capacity(state.column_ids.len());
                for &column_id in &state.column_ids {
                    if column_id == COLUMN_IDENTIFIER_ROW_ID {
                        projected.push(Value::Int((MAX_ROW_ID + position as u64) as i64));
                    } else {
                        projected.push(row.values[column_id].clone());
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

    pub fn initialize_parallel_scan(&self, _table: &DataTable) -> ParallelLocalScanState {
        ParallelLocalScanState::default()
    }

    /// Hand the next local work unit to `scan_state`. The committed scan's
    /// final batch index seeds local batch numbering.
    pub fn next_parallel_scan(
        &self,
        table: &DataTable,
        pstate: &mut ParallelLocalScanState,
        scan_state: &mut crate::scan::TableScanState,
    ) -> Result<bool> {
        let Some(local) = scan_state.local_state.as_mut() else {
            return Ok(false);
        };
        let Some(entry) = self.find(table) else {
            return Ok(false);
        };
        let total = entry.rows.lock().unwrap().len();
        let start = pstate.next_chunk * VECTOR_SIZE;
        if start >= total {
            return Ok(false);
        }
        local.next_row = start;
        local.max_row = (start + VECTOR_SIZE).min(total);
        local.batch_index = scan_state.table_state.batch_index + pstate.next_chunk as u64;
        pstate.next_chunk += 1;
        Ok(true)
    }

    //===------------------------------------------------------------===//
    // Delete / Update / Fetch
    //===------------------------------------------------------------===//

    /// Flag local rows deleted and drop their index entries. Returns the
    /// number of rows actually deleted.
    pub fn delete(&self, table: &DataTable, row_ids: &[RowId]) -> Result<u64> {
        let Some(entry) = self.find(table) else {
            return Ok(0);
        };
        let mut rows = entry.rows.lock().unwrap();
        let mut removed_values: Vec<Vec<Value>> = Vec::new();
        let mut removed_ids: Vec<RowId> = Vec::new();
        for &row_id in row_ids {
            let position = local_position(row_id, rows.len())?;
            if rows[position].deleted {
                continue;
            }
            rows[position].deleted = true;
            removed_values.push(rows[position].values.clone());
            removed_ids.push(row_id);
        }
        drop(rows);
        if !removed_ids.is_empty() {
            let chunk = convert::rows_to_batch(entry.table.physical_schema(), &removed_values)?;
            entry.indexes.scan(|index| {
                index.delete(&chunk, &removed_ids)?;
                Ok(false)
            })?;
        }
        Ok(removed_ids.len() as u64)
    }

    /// In-place update of local rows. Updates never touch indexed columns;
    /// the table layer enforces that before routing here.
    pub fn update(
        &self,
        table: &DataTable,
        row_ids: &[RowId],
        column_ids: &[usize],
        updates: &RecordBatch,
    ) -> Result<()> {
        let entry = self.find(table).ok_or_else(|| {
            Error::Internal("update routed to local storage without local data".into())
        })?;
        let update_rows = convert::batch_rows(updates)?;
        if update_rows.len() != row_ids.len() {
            return Err(Error::Internal(
                "update chunk row count does not match the row identifiers".into(),
            ));
        }
        let mut rows = entry.rows.lock().unwrap();
        for (&row_id, values) in row_ids.iter().zip(&update_rows) {
            let position = local_position(row_id, rows.len())?;
            for (&column_id, value) in column_ids.iter().zip(values) {
                rows[position].values[column_id] = value.clone();
            }
        }
        Ok(())
    }

    /// Fetch local rows by identifier over all physical columns.
    pub fn fetch_chunk(&self, table: &DataTable, row_ids: &[RowId]) -> Result<RecordBatch> {
        let entry = self.find(table).ok_or_else(|| {
            Error::Internal("fetch routed to local storage without local data".into())
        })?;
        let rows = entry.rows.lock().unwrap();
        let mut fetched: Vec<Vec<Value>> = Vec::with_capacity(row_ids.len());
        for &row_id in row_ids {
            let position = local_position(row_id, rows.len())?;
            fetched.push(rows[position].values.clone());
        }
        convert::rows_to_batch(table.physical_schema(), &fetched)
    }

    //===------------------------------------------------------------===//
    // Schema-evolution mirrors
    //===------------------------------------------------------------===//

    /// Mirror an ADD COLUMN: extend every local row with the default value.
    pub fn add_column(
        &self,
        parent: &DataTable,
        new_table: &Arc<DataTable>,
        default: Option<&ScalarExpr>,
    ) -> Result<()> {
        let Some(entry) = self.take_entry(parent) else {
            return Ok(());
        };
        let rows = entry.rows.lock().unwrap().clone();
        let mut new_rows = Vec::with_capacity(rows.len());
        for mut row in rows {
            let value = match default {
                Some(expr) => expr.eval(&row.values)?,
                None => Value::Null,
            };
            row.values.push(value);
            new_rows.push(row);
        }
        self.install_entry(new_table, new_rows)
    }

    /// Mirror a DROP COLUMN of storage ordinal `removed`.
    pub fn drop_column(
        &self,
        parent: &DataTable,
        new_table: &Arc<DataTable>,
        removed: usize,
    ) -> Result<()> {
        let Some(entry) = self.take_entry(parent) else {
            return Ok(());
        };
        let rows = entry.rows.lock().unwrap().clone();
        let mut new_rows = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.values.remove(removed);
            new_rows.push(row);
        }
        self.install_entry(new_table, new_rows)
    }

    /// Mirror an ALTER TYPE of storage ordinal `changed`: recompute the
    /// column through the cast expression over the bound-column projection.
    pub fn change_type(
        &self,
        parent: &DataTable,
        new_table: &Arc<DataTable>,
        changed: usize,
        bound_columns: &[usize],
        cast_expr: &ScalarExpr,
    ) -> Result<()> {
        let Some(entry) = self.take_entry(parent) else {
            return Ok(());
        };
        let rows = entry.rows.lock().unwrap().clone();
        let mut new_rows = Vec::with_capacity(rows.len());
        for mut row in rows {
            let input: Vec<Value> = bound_columns
                .iter()
                .map(|&bound| row.values[bound].clone())
                .collect();
            row.values[changed] = cast_expr.eval(&input)?;
            new_rows.push(row);
        }
        self.install_entry(new_table, new_rows)
    }

    /// Transfer local-data ownership to a successor version unchanged.
    pub fn move_storage(&self, parent: &DataTable, new_table: &Arc<DataTable>) -> Result<()> {
        let Some(entry) = self.take_entry(parent) else {
            return Ok(());
        };
        let rows = entry.rows.lock().unwrap().clone();
        self.install_entry(new_table, rows)
    }

    fn install_entry(&self, new_table: &Arc<DataTable>, rows: Vec<LocalRow>) -> Result<()> {
        let entry = LocalTableStorage::rebuild(Arc::clone(new_table), rows)?;
        self.tables
            .lock()
            .unwrap()
            .insert(table_key(new_table), entry);
        Ok(())
    }

    /// Check a new NOT NULL constraint against this transaction's local rows.
    pub fn verify_new_constraint(
        &self,
        table: &DataTable,
        column: usize,
        table_name: &str,
        column_name: &str,
    ) -> Result<()> {
        let Some(entry) = self.find(table) else {
            return Ok(());
        };
        let rows = entry.rows.lock().unwrap();
        for row in rows.iter().filter(|row| !row.deleted) {
            if row.values[column].is_null() {
                return Err(Error::ConstraintError(format!(
                    "NOT NULL constraint failed: {table_name}.{column_name}"
                )));
            }
        }
        Ok(())
    }

    //===------------------------------------------------------------===//
    // Bulk loading
    //===------------------------------------------------------------===//

    /// Merge an optimistically written collection into the local store.
    pub fn local_merge(
        &self,
        table: &Arc<DataTable>,
        collection: &RowGroupCollection,
    ) -> Result<()> {
        let entry = self.entry_or_create(table);
        let schema = table.physical_schema();
        let column_ids: Vec<usize> = (0..schema.fields().len()).collect();
        let mut state = collection.initialize_scan(schema, column_ids, None);
        while let Some(chunk) =
            collection.scan_committed(&mut state, TableScanType::CommittedRows)?
        {
            Self::append_chunk_to_entry(&entry, &chunk)?;
        }
        Ok(())
    }

    pub fn create_optimistic_writer(
        &self,
        table: &Arc<DataTable>,
        txn: &Transaction,
    ) -> OptimisticDataWriter {
        let collection = RowGroupCollection::new(table.physical_types());
        let state = collection.initialize_append(txn, 0);
        OptimisticDataWriter { collection, state }
    }

    //===------------------------------------------------------------===//
    // Commit
    //===------------------------------------------------------------===//

    /// Flush every table's local rows through the global append pipeline and
    /// publish them under `commit_id`.
    ///
    /// Constraints were verified at local-append time; what remains is index
    /// maintenance. Publication is two-phase so a multi-table commit stays
    /// atomic: every table's rows and index entries are flushed first, and
    /// only when all of them succeeded does any table `commit_append`. A
    /// failure mid-flush reverts every table flushed so far, leaving
    /// committed storage and indexes as they were before the commit.
    pub fn commit(&self, txn: &Transaction, commit_id: TxnId, wal: &WriteAheadLog) -> Result<()> {
        let entries: Vec<Arc<LocalTableStorage>> =
            self.tables.lock().unwrap().values().cloned().collect();
        let mut flushed: Vec<(Arc<DataTable>, u64, u64)> = Vec::new();
        for entry in &entries {
            match Self::flush_entry(entry, txn) {
                Ok(Some(flush)) => flushed.push(flush),
                Ok(None) => {}
                Err(error) => {
                    for (table, row_start, total) in flushed.into_iter().rev() {
                        table.revert_append(row_start, total)?;
                    }
                    return Err(error);
                }
            }
        }
        for (table, row_start, total) in &flushed {
            table.write_to_log(wal, *row_start, *total)?;
            table.commit_append(commit_id, *row_start, *total)?;
            debug!(
                table = table.info().table_name(),
                row_start, total, "flushed local rows"
            );
        }
        self.tables.lock().unwrap().clear();
        Ok(())
    }

    /// Append one table's surviving local rows and index entries without
    /// publishing them. On failure the table's partial append is reverted
    /// before the error returns; on success the append stays unpublished
    /// until the caller's `commit_append`.
    fn flush_entry(
        entry: &Arc<LocalTableStorage>,
        txn: &Transaction,
    ) -> Result<Option<(Arc<DataTable>, u64, u64)>> {
        let table = Arc::clone(&entry.table);
        let chunks = entry.commit_chunks()?;
        let total: u64 = chunks.iter().map(|chunk| chunk.num_rows() as u64).sum();
        if total == 0 {
            return Ok(None);
        }
        let mut state = table.append_lock()?;
        let row_start = state.row_start;
        table.initialize_append(txn, &mut state, total)?;
        let mut appended = 0u64;
        let mut result = Ok(());
        for chunk in &chunks {
            if let Err(error) = table.append(chunk, &mut state) {
                result = Err(error);
                break;
            }
            let ok = table.append_to_indexes(chunk, row_start + appended);
            appended += chunk.num_rows() as u64;
            if !ok {
                result = Err(Error::ConstraintError(
                    "PRIMARY KEY or UNIQUE constraint violated during commit append".into(),
                ));
                break;
            }
        }
        drop(state);
        if let Err(error) = result {
            table.revert_append(row_start, appended)?;
            return Err(error);
        }
        Ok(Some((table, row_start, total)))
    }
}

/// Buffers bulk-loaded chunks in a private collection that `local_merge`
/// folds into the transaction's local store.
pub struct OptimisticDataWriter {
    collection: RowGroupCollection,
    state: RowGroupAppendState,
}

impl OptimisticDataWriter {
    pub fn write_chunk(&mut self, chunk: &RecordBatch) -> Result<()> {
        self.collection.append(chunk, &mut self.state)
    }

    pub fn collection(&self) -> &RowGroupCollection {
        &self.collection
    }
}
