use strata_expr::ScalarExpr;

/// Which side of a foreign-key relationship a bound constraint describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForeignKeyKind {
    /// This table holds the foreign key; appends probe the referenced table.
    ForeignKeyTable,
    /// This table holds the referenced key; deletes probe the referencing
    /// table for inbound references.
    PrimaryKeyTable,
    /// The table references itself; participates in both directions.
    SelfReferenceTable,
}

/// A foreign-key constraint with its column references resolved.
///
/// `schema`/`table` name the *other* table of the relationship; `fk_keys`
/// are physical ordinals of the referencing side, `pk_keys` of the
/// referenced side.
#[derive(Clone, Debug)]
pub struct BoundForeignKey {
    pub kind: ForeignKeyKind,
    pub fk_keys: Vec<usize>,
    pub pk_keys: Vec<usize>,
    pub schema: String,
    pub table: String,
}

/// A constraint whose column references and expressions are resolved
/// against physical storage ordinals.
#[derive(Clone, Debug)]
pub enum BoundConstraint {
    NotNull {
        column: usize,
        column_name: String,
    },
    Check {
        expr: ScalarExpr,
        /// Physical ordinals the expression reads; updates re-verify only
        /// when one of these is among the updated columns.
        bound_columns: Vec<usize>,
    },
    /// Enforced through the unique indexes in the table's index list; kept
    /// in the constraint set so verification knows to probe them.
    Unique {
        columns: Vec<usize>,
    },
    ForeignKey(BoundForeignKey),
}

impl BoundConstraint {
    pub fn not_null(column: usize, column_name: impl Into<String>) -> BoundConstraint {
        BoundConstraint::NotNull {
            column,
            column_name: column_name.into(),
        }
    }

    pub fn check(expr: ScalarExpr) -> BoundConstraint {
        let mut bound_columns = Vec::new();
        expr.referenced_columns(&mut bound_columns);
        BoundConstraint::Check {
            expr,
            bound_columns,
        }
    }

    pub fn unique(columns: Vec<usize>) -> BoundConstraint {
        BoundConstraint::Unique { columns }
    }

    pub fn foreign_key(fk: BoundForeignKey) -> BoundConstraint {
        BoundConstraint::ForeignKey(fk)
    }
}
