use arrow::datatypes::{DataType, Field};
use strata_expr::ScalarExpr;

/// A column whose value is a pure function of other columns, evaluated at
/// insert time. The expression is bound against physical storage ordinals.
#[derive(Clone, Debug)]
pub struct GeneratedColumn {
    pub expr: ScalarExpr,
    /// Display text of the expression, used in constraint errors.
    pub text: String,
}

/// One column of a table.
///
/// `oid` is the logical ordinal (position among all columns); `storage_oid`
/// is the dense ordinal among non-generated columns and addresses columnar
/// storage. Generated columns have no storage ordinal.
#[derive(Clone, Debug)]
pub struct ColumnDefinition {
    name: String,
    data_type: DataType,
    oid: usize,
    storage_oid: Option<usize>,
    generated: Option<GeneratedColumn>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnDefinition {
        ColumnDefinition {
            name: name.into(),
            data_type,
            oid: 0,
            storage_oid: None,
            generated: None,
        }
    }

    pub fn generated(
        name: impl Into<String>,
        data_type: DataType,
        expr: ScalarExpr,
        text: impl Into<String>,
    ) -> ColumnDefinition {
        ColumnDefinition {
            name: name.into(),
            data_type,
            oid: 0,
            storage_oid: None,
            generated: Some(GeneratedColumn {
                expr,
                text: text.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn oid(&self) -> usize {
        self.oid
    }

    pub fn storage_oid(&self) -> Option<usize> {
        self.storage_oid
    }

    pub fn is_generated(&self) -> bool {
        self.generated.is_some()
    }

    pub fn generated_column(&self) -> Option<&GeneratedColumn> {
        self.generated.as_ref()
    }

    pub(crate) fn generated_column_mut(&mut self) -> Option<&mut GeneratedColumn> {
        self.generated.as_mut()
    }

    pub(crate) fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    pub fn to_field(&self) -> Field {
        Field::new(&self.name, self.data_type.clone(), true)
    }
}

/// Assign logical and storage ordinals by position: `oid` is the column's
/// index, storage ordinals number the non-generated columns densely.
pub(crate) fn renumber_columns(columns: &mut [ColumnDefinition]) {
    let mut storage_oid = 0usize;
    for (position, column) in columns.iter_mut().enumerate() {
        column.oid = position;
        if column.generated.is_some() {
            column.storage_oid = None;
            continue;
        }
        column.storage_oid = Some(storage_oid);
        storage_oid += 1;
    }
}
