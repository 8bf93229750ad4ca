#![forbid(unsafe_code)]

//! Integration tests for the append, delete and commit pipelines.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use strata_result::Error;
use strata_table::{
    BoundConstraint, Catalog, ColumnDefinition, ConflictManager, ConflictTarget, DataTable,
    HashIndex, Index, Session, TableIoManager, VerifyExistenceKind, WalRecord, WriteAheadLog,
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

    fn int_table(&self, name: &str, constraints: Vec<BoundConstraint>) -> Arc<DataTable> {
        let table = Arc::new(
            DataTable::new(
                TableIoManager::new(false),
                "main",
                name,
                vec![ColumnDefinition::new("a", DataType::Int64)],
                constraints,
                None,
            )
            .unwrap(),
        );
        self.catalog.register(Arc::clone(&table));
        table
    }
}

fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]))
}

fn int_chunk(values: &[Option<i64>]) -> RecordBatch {
    RecordBatch::try_new(
        int_schema(),
        vec![Arc::new(Int64Array::from(values.to_vec())) as ArrayRef],
    )
    .unwrap()
}

fn ints(values: &[i64]) -> RecordBatch {
    int_chunk(&values.iter().map(|&v| Some(v)).collect::<Vec<_>>())
}

fn scan_ints(table: &Arc<DataTable>, session: &Session) -> Vec<i64> {
    let mut state = table.initialize_scan(session, vec![0], None).unwrap();
    let mut out = Vec::new();
    while let Some(batch) = table.scan(session, &mut state).unwrap() {
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        out.extend(column.iter().flatten());
    }
    out
}

#[test]
fn not_null_rejection_leaves_no_partial_state() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![BoundConstraint::not_null(0, "a")]);
    let session = fixture.session();

    let err = DataTable::local_append_chunk(&table, &session, &int_chunk(&[None])).unwrap_err();
    match err {
        Error::ConstraintError(message) => {
            assert_eq!(message, "NOT NULL constraint failed: t.a");
        }
        other => panic!("expected a constraint error, got {other:?}"),
    }
    assert_eq!(table.info().cardinality(), 0);
    assert!(session.local_storage().is_empty());
}

#[test]
fn unique_conflict_against_committed_rows() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![BoundConstraint::unique(vec![0])]);
    table
        .info()
        .indexes()
        .add(Arc::new(HashIndex::unique_index("t_a_key", vec![0])));

    let first = fixture.session();
    DataTable::local_append_chunk(&table, &first, &ints(&[1])).unwrap();
    first.commit().unwrap();

    let second = fixture.session();
    let err = DataTable::local_append_chunk(&table, &second, &ints(&[1])).unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)), "got {err:?}");

    assert_eq!(scan_ints(&table, &second), vec![1]);
    assert_eq!(table.info().cardinality(), 1);
}

#[test]
fn local_duplicate_is_caught_by_the_local_index() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![BoundConstraint::unique(vec![0])]);
    table
        .info()
        .indexes()
        .add(Arc::new(HashIndex::unique_index("t_a_key", vec![0])));

    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[1])).unwrap();
    let err = DataTable::local_append_chunk(&table, &session, &ints(&[1])).unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)));

    // The failed append left no partial row: only the first row commits.
    session.commit().unwrap();
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![1]);
}

#[test]
fn local_append_then_commit_preserves_insertion_order() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[5, 6])).unwrap();
    DataTable::local_append_chunk(&table, &session, &ints(&[7])).unwrap();

    // Uncommitted rows are visible to the owning transaction only.
    assert_eq!(scan_ints(&table, &session), vec![5, 6, 7]);
    let other = fixture.session();
    assert!(scan_ints(&table, &other).is_empty());

    session.commit().unwrap();
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![5, 6, 7]);
    assert_eq!(table.info().cardinality(), 3);
}

#[test]
fn rollback_discards_local_rows() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[1, 2])).unwrap();
    session.rollback();

    let reader = fixture.session();
    assert!(scan_ints(&table, &reader).is_empty());
    assert_eq!(table.info().cardinality(), 0);
}

#[test]
fn append_then_revert_restores_rows_and_indexes() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![BoundConstraint::unique(vec![0])]);
    let index = Arc::new(HashIndex::unique_index("t_a_key", vec![0]));
    table.info().indexes().add(Arc::clone(&index) as Arc<dyn Index>);

    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &ints(&[1, 2])).unwrap();
    seed.commit().unwrap();
    assert_eq!(table.get_total_rows(), 2);
    assert_eq!(index.entry_count(), 2);

    // Bulk-append two more rows, then revert the whole append.
    let session = fixture.session();
    let chunk = ints(&[3, 4]);
    let row_start = {
        let mut state = table.append_lock().unwrap();
        let row_start = state.row_start;
        table.initialize_append(session.txn(), &mut state, 2).unwrap();
        table.append(&chunk, &mut state).unwrap();
        assert!(table.append_to_indexes(&chunk, row_start));
        row_start
    };
    assert_eq!(table.get_total_rows(), 4);
    assert_eq!(index.entry_count(), 4);

    table.revert_append(row_start, 2).unwrap();
    assert_eq!(table.get_total_rows(), 2);
    assert_eq!(table.info().cardinality(), 2);
    assert_eq!(index.entry_count(), 2);
    assert!(!index.contains_row(2));
    assert!(!index.contains_row(3));
}

#[test]
fn commit_time_index_conflict_reverts_the_append() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![BoundConstraint::unique(vec![0])]);
    let index = Arc::new(HashIndex::unique_index("t_a_key", vec![0]));
    table.info().indexes().add(Arc::clone(&index) as Arc<dyn Index>);

    // Two transactions append the same key; neither sees the other's local
    // rows, so both pass verification.
    let first = fixture.session();
    let second = fixture.session();
    DataTable::local_append_chunk(&table, &first, &ints(&[1])).unwrap();
    DataTable::local_append_chunk(&table, &second, &ints(&[1])).unwrap();

    first.commit().unwrap();
    let err = second.commit().unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)), "got {err:?}");

    // The loser's append was reverted: storage, cardinality and the index
    // all reflect the winner only.
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![1]);
    assert_eq!(table.get_total_rows(), 1);
    assert_eq!(table.info().cardinality(), 1);
    assert_eq!(index.entry_count(), 1);
}

#[test]
fn multi_table_commit_failure_reverts_every_table() {
    let fixture = Fixture::new();
    let t1 = fixture.int_table("t1", vec![BoundConstraint::unique(vec![0])]);
    let index1 = Arc::new(HashIndex::unique_index("t1_a_key", vec![0]));
    t1.info().indexes().add(Arc::clone(&index1) as Arc<dyn Index>);
    let t2 = fixture.int_table("t2", vec![BoundConstraint::unique(vec![0])]);
    let index2 = Arc::new(HashIndex::unique_index("t2_a_key", vec![0]));
    t2.info().indexes().add(Arc::clone(&index2) as Arc<dyn Index>);

    // Two transactions race: the loser's t2 row collides at commit time,
    // possibly after its t1 row was already flushed.
    let winner = fixture.session();
    let loser = fixture.session();
    DataTable::local_append_chunk(&t2, &winner, &ints(&[9])).unwrap();
    DataTable::local_append_chunk(&t1, &loser, &ints(&[5])).unwrap();
    DataTable::local_append_chunk(&t2, &loser, &ints(&[9])).unwrap();

    winner.commit().unwrap();
    let err = loser.commit().unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)), "got {err:?}");

    // Whichever order the tables flushed in, the failed commit left no
    // trace: no published rows, no physical tail, no index entries, no
    // cardinality.
    assert_eq!(t1.get_total_rows(), 0);
    assert_eq!(t1.info().cardinality(), 0);
    assert_eq!(index1.entry_count(), 0);
    assert_eq!(t2.get_total_rows(), 1);
    assert_eq!(t2.info().cardinality(), 1);
    assert_eq!(index2.entry_count(), 1);

    let reader = fixture.session();
    assert!(scan_ints(&t1, &reader).is_empty());
    assert_eq!(scan_ints(&t2, &reader), vec![9]);
}

#[test]
fn delete_routes_by_row_id_space() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);

    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &ints(&[10, 20, 30])).unwrap();
    seed.commit().unwrap();

    // Committed delete.
    let session = fixture.session();
    assert_eq!(table.delete(&session, &[1]).unwrap(), 1);
    assert_eq!(scan_ints(&table, &session), vec![10, 30]);
    // Deleting the same row again is a no-op for this transaction.
    assert_eq!(table.delete(&session, &[1]).unwrap(), 0);

    // Local delete: local row ids start at MAX_ROW_ID.
    DataTable::local_append_chunk(&table, &session, &ints(&[40])).unwrap();
    assert_eq!(scan_ints(&table, &session), vec![10, 30, 40]);
    assert_eq!(
        table.delete(&session, &[strata_table::MAX_ROW_ID]).unwrap(),
        1
    );
    assert_eq!(scan_ints(&table, &session), vec![10, 30]);

    session.commit().unwrap();
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![10, 30]);
}

#[test]
fn snapshots_do_not_observe_later_commits() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);

    let writer = fixture.session();
    let reader = fixture.session();
    DataTable::local_append_chunk(&table, &writer, &ints(&[1])).unwrap();
    writer.commit().unwrap();

    // The reader's snapshot predates the commit.
    assert!(scan_ints(&table, &reader).is_empty());
    let late_reader = fixture.session();
    assert_eq!(scan_ints(&table, &late_reader), vec![1]);
}

#[test]
fn commit_streams_appends_through_the_wal() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[1, 2, 3])).unwrap();
    session.commit().unwrap();

    let records = fixture.wal.records();
    assert_eq!(records.len(), 2);
    match &records[0] {
        WalRecord::SetTable { schema, table } => {
            assert_eq!(schema, "main");
            assert_eq!(table, "t");
        }
        other => panic!("expected SetTable, got {other:?}"),
    }
    match &records[1] {
        WalRecord::Insert { chunk } => assert_eq!(chunk.num_rows(), 3),
        other => panic!("expected Insert, got {other:?}"),
    }
}

#[test]
fn skip_writing_suppresses_wal_records() {
    let fixture = Fixture::new();
    fixture.wal.set_skip_writing(true);
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[1])).unwrap();
    session.commit().unwrap();
    assert!(fixture.wal.records().is_empty());
}

#[test]
fn update_rejects_indexed_columns() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    table
        .info()
        .indexes()
        .add(Arc::new(HashIndex::unique_index("t_a_key", vec![0])));

    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &ints(&[1])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    let err = table
        .update(&session, &[0], &[0], &ints(&[9]))
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)), "got {err:?}");
}

#[test]
fn updates_route_to_committed_and_local_rows() {
    let fixture = Fixture::new();
    let table = Arc::new(
        DataTable::new(
            TableIoManager::new(false),
            "main",
            "t",
            vec![
                ColumnDefinition::new("a", DataType::Int64),
                ColumnDefinition::new("b", DataType::Int64),
            ],
            vec![],
            None,
        )
        .unwrap(),
    );
    fixture.catalog.register(Arc::clone(&table));

    fn two_ints(a: &[i64], b: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(a.to_vec())) as ArrayRef,
                Arc::new(Int64Array::from(b.to_vec())) as ArrayRef,
            ],
        )
        .unwrap()
    }

    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &two_ints(&[1, 2], &[10, 20])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    // Committed update of column b.
    table
        .update(&session, &[0], &[1], &ints(&[11]))
        .unwrap();
    // Local row update.
    DataTable::local_append_chunk(&table, &session, &two_ints(&[3], &[30])).unwrap();
    table
        .update(&session, &[strata_table::MAX_ROW_ID], &[1], &ints(&[31]))
        .unwrap();

    let mut state = table.initialize_scan(&session, vec![1], None).unwrap();
    let mut values = Vec::new();
    while let Some(batch) = table.scan(&session, &mut state).unwrap() {
        values.extend(
            batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .iter()
                .flatten(),
        );
    }
    assert_eq!(values, vec![11, 20, 31]);
}

#[test]
fn on_conflict_verification_captures_target_conflicts_only() {
    let fixture = Fixture::new();
    let table = Arc::new(
        DataTable::new(
            TableIoManager::new(false),
            "main",
            "t",
            vec![
                ColumnDefinition::new("a", DataType::Int64),
                ColumnDefinition::new("b", DataType::Int64),
            ],
            vec![
                BoundConstraint::unique(vec![0]),
                BoundConstraint::unique(vec![1]),
            ],
            None,
        )
        .unwrap(),
    );
    table
        .info()
        .indexes()
        .add(Arc::new(HashIndex::unique_index("t_a_key", vec![0])));
    table
        .info()
        .indexes()
        .add(Arc::new(HashIndex::unique_index("t_b_key", vec![1])));
    fixture.catalog.register(Arc::clone(&table));

    fn two_ints(a: &[i64], b: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(a.to_vec())) as ArrayRef,
                Arc::new(Int64Array::from(b.to_vec())) as ArrayRef,
            ],
        )
        .unwrap()
    }

    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &two_ints(&[1], &[10])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    // Conflict on the target column: captured, not raised.
    let chunk = two_ints(&[1], &[20]);
    let mut manager = ConflictManager::new(VerifyExistenceKind::Append, chunk.num_rows())
        .with_conflict_target(ConflictTarget::new([0]));
    table
        .verify_append_constraints(&session, &chunk, Some(&mut manager))
        .unwrap();
    manager.finalize();
    assert_eq!(manager.conflicts(), &[0]);

    // Conflict on a unique index outside the target: a hard error.
    let chunk = two_ints(&[2], &[10]);
    let mut manager = ConflictManager::new(VerifyExistenceKind::Append, chunk.num_rows())
        .with_conflict_target(ConflictTarget::new([0]));
    let err = table
        .verify_append_constraints(&session, &chunk, Some(&mut manager))
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)), "got {err:?}");
}

#[test]
fn update_column_writes_directly_to_row_groups() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let seed = fixture.session();
    DataTable::local_append_chunk(&table, &seed, &ints(&[1, 2])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    table
        .update_column(&session, &[1], &[0], &ints(&[22]))
        .unwrap();
    assert_eq!(scan_ints(&table, &session), vec![1, 22]);

    // Only top-level columns are addressable.
    let err = table
        .update_column(&session, &[1], &[0, 1], &ints(&[5]))
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)), "got {err:?}");
}

#[test]
fn optimistic_writer_feeds_the_local_store() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();

    let mut writer = table.create_optimistic_writer(&session);
    writer.write_chunk(&ints(&[1, 2])).unwrap();
    writer.write_chunk(&ints(&[3])).unwrap();
    table.local_merge(&session, writer.collection()).unwrap();

    assert_eq!(scan_ints(&table, &session), vec![1, 2, 3]);
    session.commit().unwrap();
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![1, 2, 3]);
}

#[test]
fn merge_storage_appends_a_collection() {
    let fixture = Fixture::new();
    let table = fixture.int_table("t", vec![]);
    let session = fixture.session();
    DataTable::local_append_chunk(&table, &session, &ints(&[1])).unwrap();
    session.commit().unwrap();

    let other = strata_table::RowGroupCollection::new(vec![DataType::Int64]);
    let loader = fixture.manager.begin();
    let mut state = other.initialize_append(&loader, 2);
    other.append(&ints(&[8, 9]), &mut state).unwrap();
    let commit_id = fixture.manager.allocate_commit_id();
    other.commit_append(commit_id, 0, 2).unwrap();
    fixture.manager.mark_committed(commit_id);

    table.merge_storage(&other).unwrap();
    assert_eq!(table.get_total_rows(), 3);
    let reader = fixture.session();
    assert_eq!(scan_ints(&table, &reader), vec![1, 8, 9]);
}
