#![forbid(unsafe_code)]

//! Serial, filtered, parallel and segment scans.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use strata_expr::{FilterOp, TableFilter, TableFilterSet, Value};
use strata_table::{
    Catalog, ColumnDefinition, DataTable, Session, SessionConfig, TableIoManager, TableScanType,
    VECTOR_SIZE, WriteAheadLog,
};
use strata_transaction::TxnIdManager;

struct Fixture {
    manager: TxnIdManager,
    catalog: Arc<Catalog>,
    wal: Arc<WriteAheadLog>,
}

impl Fixture {
    fn new() -> Fixture {
        strata_test_utils::init_tracing_for_tests();
        Fixture {
            manager: TxnIdManager::new(),
            catalog: Catalog::new(),
            wal: Arc::new(WriteAheadLog::new()),
        }
    }

    fn session(&self) -> Session {
        Session::begin(&self.manager, Arc::clone(&self.catalog), Arc::clone(&self.wal))
    }

    fn session_verifying_parallelism(&self) -> Session {
        Session::begin_with_config(
            &self.manager,
            Arc::clone(&self.catalog),
            Arc::clone(&self.wal),
            SessionConfig {
                verify_parallelism: true,
            },
        )
    }

    fn int_table(&self, name: &str) -> Arc<DataTable> {
        let table = Arc::new(
            DataTable::new(
                TableIoManager::new(false),
                "main",
                name,
                vec![ColumnDefinition::new("a", DataType::Int64)],
                vec![],
                None,
            )
            .unwrap(),
        );
        self.catalog.register(Arc::clone(&table));
        table
    }
}

fn ints(values: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
    RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(values.to_vec())) as ArrayRef],
    )
    .unwrap()
}

fn batch_ints(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .iter()
        .flatten()
        .collect()
}

fn commit_range(fixture: &Fixture, table: &Arc<DataTable>, range: std::ops::Range<i64>) {
    let session = fixture.session();
    let values: Vec<i64> = range.collect();
    DataTable::local_append_chunk(table, &session, &ints(&values)).unwrap();
    session.commit().unwrap();
}

#[test]
fn filtered_scan_applies_to_committed_and_local_rows() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 1..6);

    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[2, 7])).unwrap();

    let filters = TableFilterSet::new(vec![TableFilter::new(
        0,
        FilterOp::GreaterThan(Value::Int(3)),
    )]);
    let mut state = table
        .initialize_scan(&session, vec![0], Some(filters))
        .unwrap();
    let mut values = Vec::new();
    while let Some(batch) = table.scan(&session, &mut state).unwrap() {
        values.extend(batch_ints(&batch));
    }
    assert_eq!(values, vec![4, 5, 7]);
}

#[test]
fn max_threads_scales_with_total_rows() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    let serial = SessionConfig::default();
    let verified = SessionConfig {
        verify_parallelism: true,
    };
    assert_eq!(table.max_threads(&serial), 1);

    commit_range(&fixture, &table, 0..3000);
    // 3000 rows in single-vector units of 2048.
    assert_eq!(table.max_threads(&verified), 3000 / VECTOR_SIZE + 1);
    assert_eq!(table.max_threads(&serial), 1);
}

#[test]
fn parallel_scan_drains_committed_then_local_units() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 0..3000);

    let session = fixture.session_verifying_parallelism();
    DataTable::local_append_chunk(&table, &session, &ints(&[9001, 9002])).unwrap();

    let mut pstate = table.initialize_parallel_scan(&session);
    let mut scan_state = table.initialize_scan(&session, vec![0], None).unwrap();
    let mut values = Vec::new();
    let mut units = 0;
    while table
        .next_parallel_scan(&session, &mut pstate, &mut scan_state)
        .unwrap()
    {
        units += 1;
        while let Some(batch) = table.scan(&session, &mut scan_state).unwrap() {
            values.extend(batch_ints(&batch));
        }
    }
    // Two committed single-vector units plus one local unit.
    assert_eq!(units, 3);
    let expected: Vec<i64> = (0..3000).chain([9001, 9002]).collect();
    assert_eq!(values, expected);
}

#[test]
fn parallel_scan_without_local_rows_ends_cleanly() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 0..10);

    let session = fixture.session();
    let mut pstate = table.initialize_parallel_scan(&session);
    let mut scan_state = table.initialize_scan(&session, vec![0], None).unwrap();
    let mut values = Vec::new();
    while table
        .next_parallel_scan(&session, &mut pstate, &mut scan_state)
        .unwrap()
    {
        while let Some(batch) = table.scan(&session, &mut scan_state).unwrap() {
            values.extend(batch_ints(&batch));
        }
    }
    assert_eq!(values, (0..10).collect::<Vec<i64>>());
    // Drained: further calls keep returning false.
    assert!(
        !table
            .next_parallel_scan(&session, &mut pstate, &mut scan_state)
            .unwrap()
    );
}

#[test]
fn scan_table_segment_slices_straddling_chunks() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 0..10);

    let mut values = Vec::new();
    let mut chunks = 0;
    table
        .scan_table_segment(3, 4, |chunk| {
            chunks += 1;
            values.extend(batch_ints(chunk));
            Ok(())
        })
        .unwrap();
    assert_eq!(chunks, 1);
    assert_eq!(values, vec![3, 4, 5, 6]);
}

#[test]
fn scan_table_segment_covers_vector_boundaries() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 0..(VECTOR_SIZE as i64 + 100));

    // A range straddling the first vector boundary arrives as two chunks.
    let start = VECTOR_SIZE as u64 - 10;
    let mut values = Vec::new();
    let mut chunks = 0;
    table
        .scan_table_segment(start, 20, |chunk| {
            chunks += 1;
            values.extend(batch_ints(chunk));
            Ok(())
        })
        .unwrap();
    assert_eq!(chunks, 2);
    let expected: Vec<i64> = (start as i64..start as i64 + 20).collect();
    assert_eq!(values, expected);
}

#[test]
fn index_scans_bypass_snapshots() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 1..4);

    // Delete the middle row and commit the delete.
    let deleter = fixture.session();
    assert_eq!(table.delete(&deleter, &[1]).unwrap(), 1);
    deleter.commit().unwrap();

    // Each scan state holds the append lock; scope them so the second
    // acquisition does not deadlock.
    {
        let mut state = table.initialize_create_index_scan(vec![0]).unwrap();
        let mut kept = Vec::new();
        while let Some(batch) = table
            .create_index_scan(&mut state.scan, TableScanType::CommittedRowsOmitDeleted)
            .unwrap()
        {
            kept.extend(batch_ints(&batch));
        }
        assert_eq!(kept, vec![1, 3]);
    }

    // The physical scan still observes the deleted row.
    {
        let mut state = table.initialize_create_index_scan(vec![0]).unwrap();
        let mut all = Vec::new();
        while let Some(batch) = table
            .create_index_scan(&mut state.scan, TableScanType::CommittedRows)
            .unwrap()
        {
            all.extend(batch_ints(&batch));
        }
        assert_eq!(all, vec![1, 2, 3]);
    }
}

#[test]
fn offset_scan_bounds_an_index_build() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t");
    commit_range(&fixture, &table, 0..100);

    let mut state = table.initialize_scan_with_offset(vec![0], 0, 40).unwrap();
    let mut values = Vec::new();
    while let Some(batch) = table
        .create_index_scan(&mut state, TableScanType::CommittedRows)
        .unwrap()
    {
        values.extend(batch_ints(&batch));
    }
    assert_eq!(values, (0..40).collect::<Vec<i64>>());
}
