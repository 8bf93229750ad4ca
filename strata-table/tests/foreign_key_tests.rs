#![forbid(unsafe_code)]

//! Foreign-key verification across the committed store and the current
//! transaction's local store.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};

use strata_result::Error;
use strata_table::{
    BoundConstraint, BoundForeignKey, Catalog, ColumnDefinition, DataTable, ForeignKeyKind,
    HashIndex, Session, TableIoManager, WriteAheadLog,
};
use strata_transaction::TxnIdManager;

struct Fixture {
    manager: TxnIdManager,
    catalog: Arc<Catalog>,
    wal: Arc<WriteAheadLog>,
    parent: Arc<DataTable>,
    child: Arc<DataTable>,
}

impl Fixture {
    /// `p(a)` referenced by `c(b)`: `c.b -> p.a`.
    fn new() -> Fixture {
        strata_test_utils::init_tracing_for_tests();
        let catalog = Catalog::new();

        let parent = Arc::new(
            DataTable::new(
                TableIoManager::new(false),
                "main",
                "p",
                vec![ColumnDefinition::new("a", DataType::Int64)],
                vec![
                    BoundConstraint::unique(vec![0]),
                    BoundConstraint::foreign_key(BoundForeignKey {
                        kind: ForeignKeyKind::PrimaryKeyTable,
                        fk_keys: vec![0],
                        pk_keys: vec![0],
                        schema: "main".into(),
                        table: "c".into(),
                    }),
                ],
                None,
            )
            .unwrap(),
        );
        parent
            .info()
            .indexes()
            .add(Arc::new(HashIndex::unique_index("p_a_key", vec![0])));
        catalog.register(Arc::clone(&parent));

        let child = Arc::new(
            DataTable::new(
                TableIoManager::new(false),
                "main",
                "c",
                vec![ColumnDefinition::new("b", DataType::Int64)],
                vec![BoundConstraint::foreign_key(BoundForeignKey {
                    kind: ForeignKeyKind::ForeignKeyTable,
                    fk_keys: vec![0],
                    pk_keys: vec![0],
                    schema: "main".into(),
                    table: "p".into(),
                })],
                None,
            )
            .unwrap(),
        );
        child
            .info()
            .indexes()
            .add(Arc::new(HashIndex::foreign_key_index("c_b_fkey", vec![0])));
        catalog.register(Arc::clone(&child));

        Fixture {
            manager: TxnIdManager::new(),
            catalog,
            wal: Arc::new(WriteAheadLog::new()),
            parent,
            child,
        }
    }

    fn session(&self) -> Session {
        Session::begin(&self.manager, Arc::clone(&self.catalog), Arc::clone(&self.wal))
    }
}

fn ints(values: &[Option<i64>]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
    RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(values.to_vec())) as ArrayRef],
    )
    .unwrap()
}

fn present(values: &[i64]) -> RecordBatch {
    ints(&values.iter().map(|&v| Some(v)).collect::<Vec<_>>())
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
fn append_without_a_matching_parent_fails() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let err =
        DataTable::local_append_chunk(&fixture.child, &session, &present(&[9])).unwrap_err();
    match err {
        Error::ConstraintError(message) => {
            assert!(
                message.contains("does not exist in the referenced table"),
                "unexpected message: {message}"
            );
            assert!(message.contains('9'), "unexpected message: {message}");
        }
        other => panic!("expected a constraint error, got {other:?}"),
    }
}

#[test]
fn append_satisfied_by_the_transactions_local_parent() {
    let fixture = Fixture::new();
    let session = fixture.session();

    DataTable::local_append_chunk(&fixture.parent, &session, &present(&[7])).unwrap();
    DataTable::local_append_chunk(&fixture.child, &session, &present(&[7])).unwrap();
    session.commit().unwrap();

    let reader = fixture.session();
    assert_eq!(scan_ints(&fixture.parent, &reader), vec![7]);
    assert_eq!(scan_ints(&fixture.child, &reader), vec![7]);
}

#[test]
fn append_satisfied_by_the_union_of_both_stores() {
    let fixture = Fixture::new();
    let seed = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &seed, &present(&[1])).unwrap();
    seed.commit().unwrap();

    // Key 1 exists only committed, key 2 only in this transaction's local
    // store; the append needs both.
    let session = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &session, &present(&[2])).unwrap();
    DataTable::local_append_chunk(&fixture.child, &session, &present(&[1, 2])).unwrap();

    // A key in neither store still fails.
    let err =
        DataTable::local_append_chunk(&fixture.child, &session, &present(&[3])).unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)));
}

#[test]
fn null_foreign_keys_are_vacuously_satisfied() {
    let fixture = Fixture::new();
    let session = fixture.session();
    DataTable::local_append_chunk(&fixture.child, &session, &ints(&[None])).unwrap();
}

#[test]
fn delete_blocked_by_a_committed_child() {
    let fixture = Fixture::new();
    let seed = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &seed, &present(&[5])).unwrap();
    DataTable::local_append_chunk(&fixture.child, &seed, &present(&[5])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    let err = fixture.parent.delete(&session, &[0]).unwrap_err();
    match err {
        Error::ConstraintError(message) => {
            assert!(
                message.contains("is still referenced by a foreign key"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected a constraint error, got {other:?}"),
    }
    assert_eq!(scan_ints(&fixture.parent, &session), vec![5]);
}

#[test]
fn delete_blocked_by_the_transactions_own_local_child() {
    let fixture = Fixture::new();
    let seed = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &seed, &present(&[5])).unwrap();
    seed.commit().unwrap();

    let session = fixture.session();
    DataTable::local_append_chunk(&fixture.child, &session, &present(&[5])).unwrap();
    let err = fixture.parent.delete(&session, &[0]).unwrap_err();
    assert!(matches!(err, Error::ConstraintError(_)), "got {err:?}");
}

#[test]
fn delete_ignores_other_transactions_local_children() {
    let fixture = Fixture::new();
    let seed = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &seed, &present(&[5])).unwrap();
    seed.commit().unwrap();

    // Another transaction holds an uncommitted child referencing key 5.
    let other = fixture.session();
    DataTable::local_append_chunk(&fixture.child, &other, &present(&[5])).unwrap();

    // Only the deleting transaction's local store is consulted, so the
    // delete goes through.
    let session = fixture.session();
    assert_eq!(fixture.parent.delete(&session, &[0]).unwrap(), 1);
    assert!(scan_ints(&fixture.parent, &session).is_empty());
}

#[test]
fn deleted_children_block_until_index_cleanup() {
    let fixture = Fixture::new();
    let seed = fixture.session();
    DataTable::local_append_chunk(&fixture.parent, &seed, &present(&[5])).unwrap();
    DataTable::local_append_chunk(&fixture.child, &seed, &present(&[5])).unwrap();
    seed.commit().unwrap();

    let first = fixture.session();
    assert_eq!(fixture.child.delete(&first, &[0]).unwrap(), 1);
    first.commit().unwrap();

    // Committed index entries outlive MVCC deletes until the row is
    // reclaimed, so the parent delete stays blocked until the child's entry
    // is removed from the index explicitly.
    let second = fixture.session();
    assert!(fixture.parent.delete(&second, &[0]).is_err());

    fixture.child.remove_from_indexes_by_id(&[0]).unwrap();
    let third = fixture.session();
    assert_eq!(fixture.parent.delete(&third, &[0]).unwrap(), 1);
}
