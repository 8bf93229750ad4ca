use std::cmp::Ordering;

use crate::value::{Value, compare_values};

/// Predicate pushed into a table scan.
#[derive(Clone, Debug)]
pub enum FilterOp {
    Equals(Value),
    GreaterThan(Value),
    GreaterThanOrEquals(Value),
    LessThan(Value),
    LessThanOrEquals(Value),
    IsNull,
    IsNotNull,
}

/// A filter over one projected scan column.
///
/// `column` is a position into the scan's projection list, not a table
/// ordinal: the executor pushes filters down against the columns it asked
/// the scan to produce.
#[derive(Clone, Debug)]
pub struct TableFilter {
    pub column: usize,
    pub op: FilterOp,
}

impl TableFilter {
    pub fn new(column: usize, op: FilterOp) -> TableFilter {
        TableFilter { column, op }
    }

    /// Whether the projected value passes the filter. NULL passes only
    /// explicit IS NULL checks.
    pub fn matches(&self, value: &Value) -> bool {
        match &self.op {
            FilterOp::IsNull => value.is_null(),
            FilterOp::IsNotNull => !value.is_null(),
            FilterOp::Equals(target) => cmp_is(value, target, |ord| ord == Ordering::Equal),
            FilterOp::GreaterThan(target) => cmp_is(value, target, |ord| ord == Ordering::Greater),
            FilterOp::GreaterThanOrEquals(target) => {
                cmp_is(value, target, |ord| ord != Ordering::Less)
            }
            FilterOp::LessThan(target) => cmp_is(value, target, |ord| ord == Ordering::Less),
            FilterOp::LessThanOrEquals(target) => {
                cmp_is(value, target, |ord| ord != Ordering::Greater)
            }
        }
    }
}

fn cmp_is(value: &Value, target: &Value, pred: fn(Ordering) -> bool) -> bool {
    match compare_values(value, target) {
        Some(ord) => pred(ord),
        None => false,
    }
}

/// Conjunction of filters attached to a scan.
#[derive(Clone, Debug, Default)]
pub struct TableFilterSet {
    pub filters: Vec<TableFilter>,
}

impl TableFilterSet {
    pub fn new(filters: Vec<TableFilter>) -> TableFilterSet {
        TableFilterSet { filters }
    }

    /// True when every filter accepts its projected value.
    pub fn row_matches(&self, projected: &[Value]) -> bool {
        self.filters
            .iter()
            .all(|filter| match projected.get(filter.column) {
                Some(value) => filter.matches(value),
                None => false,
            })
    }
}
