use strata_expr::Value;
use strata_transaction::{TXN_ID_NONE, TxnId};

use crate::types::ROW_GROUP_SIZE;

/// One fixed-capacity horizontal partition of a table.
///
/// Columns are dense `Value` vectors of equal length; `created_by` and
/// `deleted_by` carry the MVCC stamps for each row.
#[derive(Clone, Debug)]
pub(crate) struct RowGroup {
    pub(crate) start: u64,
    pub(crate) columns: Vec<Vec<Value>>,
    pub(crate) created_by: Vec<TxnId>,
    pub(crate) deleted_by: Vec<TxnId>,
}

impl RowGroup {
    pub(crate) fn new(start: u64, width: usize) -> RowGroup {
        RowGroup {
            start,
            columns: vec![Vec::new(); width],
            created_by: Vec::new(),
            deleted_by: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.created_by.len()
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len() >= ROW_GROUP_SIZE
    }

    pub(crate) fn append_row(&mut self, values: &[Value], created_by: TxnId) {
        debug_assert_eq!(values.len(), self.columns.len());
        debug_assert!(!self.is_full());
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value.clone());
        }
        self.created_by.push(created_by);
        self.deleted_by.push(TXN_ID_NONE);
    }

    /// Append a row preserving existing MVCC stamps (storage merges).
    pub(crate) fn append_stamped_row(&mut self, values: &[Value], created: TxnId, deleted: TxnId) {
        debug_assert_eq!(values.len(), self.columns.len());
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value.clone());
        }
        self.created_by.push(created);
        self.deleted_by.push(deleted);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        for column in &mut self.columns {
            column.truncate(len);
        }
        self.created_by.truncate(len);
        self.deleted_by.truncate(len);
    }

    /// Consistency checks; compiled to nothing in release builds.
    pub(crate) fn check_invariants(&self) {
        debug_assert_eq!(self.created_by.len(), self.deleted_by.len());
        for column in &self.columns {
            debug_assert_eq!(column.len(), self.created_by.len());
        }
        debug_assert!(self.len() <= ROW_GROUP_SIZE);
        debug_assert_eq!(self.start % ROW_GROUP_SIZE as u64, 0);
    }
}
