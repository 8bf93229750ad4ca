use std::cmp::Ordering;

use strata_expr::{Value, compare_values};

/// Per-column statistics maintained by the row-group collection.
///
/// Min/max grow monotonically under appends and in-place updates; deletes
/// and reverts trigger a recompute.
#[derive(Clone, Debug, Default)]
pub struct ColumnStats {
    pub null_count: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl ColumnStats {
    pub fn update(&mut self, value: &Value) {
        if value.is_null() {
            self.null_count += 1;
            return;
        }
        match &self.min {
            Some(min) if compare_values(value, min) != Some(Ordering::Less) => {}
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if compare_values(value, max) != Some(Ordering::Greater) => {}
            _ => self.max = Some(value.clone()),
        }
    }

    pub fn reset(&mut self) {
        *self = ColumnStats::default();
    }
}
