//! Constraint verification for appends, updates and deletes.
//!
//! Checks run in a fixed order: generated columns, NOT NULL, CHECK, UNIQUE
//! (via index probing), FOREIGN KEY. Later checks may rely on earlier
//! validity, e.g. CHECK expressions dereferencing columns whose NOT NULL was
//! just established.

use arrow::array::{Array, ArrayRef, RecordBatch, new_null_array};

use strata_expr::{Value, convert};
use strata_result::{Error, Result};

use crate::conflict::{ConflictManager, ConflictMode, VerifyExistenceKind};
use crate::constraint::{BoundConstraint, BoundForeignKey, ForeignKeyKind};
use crate::data_table::DataTable;
use crate::index::Index;
use crate::session::Session;

fn verify_not_null_vector(table_name: &str, column_name: &str, array: &dyn Array) -> Result<()> {
    if array.null_count() == 0 {
        return Ok(());
    }
    Err(Error::ConstraintError(format!(
        "NOT NULL constraint failed: {table_name}.{column_name}"
    )))
}

fn verify_check_rows(
    table_name: &str,
    expr: &strata_expr::ScalarExpr,
    rows: &[Vec<Value>],
) -> Result<()> {
    for row in rows {
        let value = expr.eval(row).map_err(|error| {
            Error::ConstraintError(format!(
                "CHECK constraint failed: {table_name} (Error: {error})"
            ))
        })?;
        match value {
            // A null check result is not a violation.
            Value::Null => {}
            other => match other.truth() {
                Some(true) => {}
                Some(false) => {
                    return Err(Error::ConstraintError(format!(
                        "CHECK constraint failed: {table_name}"
                    )));
                }
                None => {
                    return Err(Error::ConstraintError(format!(
                        "CHECK constraint failed: {table_name} \
                         (Error: expression did not yield an integer)"
                    )));
                }
            },
        }
    }
    Ok(())
}

/// Project update columns into the table's full physical layout when every
/// column a CHECK expression reads is among the updated columns. `None` when
/// none of them is (the constraint cannot have changed).
fn build_mock_rows(
    width: usize,
    column_ids: &[usize],
    desired: &[usize],
    updates: &RecordBatch,
) -> Result<Option<Vec<Vec<Value>>>> {
    let found = column_ids
        .iter()
        .filter(|column| desired.contains(column))
        .count();
    if found == 0 {
        return Ok(None);
    }
    if found != desired.len() {
        // The binder adds every referenced column to the update; a partial
        // set indicates a malformed plan.
        return Err(Error::Internal(
            "not all columns required for the CHECK constraint are present in the updated chunk"
                .into(),
        ));
    }
    let update_rows = convert::batch_rows(updates)?;
    let mut mock_rows = Vec::with_capacity(update_rows.len());
    for row in update_rows {
        let mut full = vec![Value::Null; width];
        for (position, &column_id) in column_ids.iter().enumerate() {
            full[column_id] = row[position].clone();
        }
        mock_rows.push(full);
    }
    Ok(Some(mock_rows))
}

fn is_foreign_key_error(is_append: bool, count: usize, matches: &ConflictManager) -> bool {
    if is_append {
        // Every input needs a match.
        matches.match_count() != count
    } else {
        // No input may match.
        matches.match_count() != 0
    }
}

/// First offending input: the first match for a delete, the first missing
/// match for an append.
fn locate_error_index(is_append: bool, count: usize, matches: &ConflictManager) -> Option<usize> {
    if !is_append {
        return matches.conflicts().first().copied();
    }
    (0..count).find(|&row| !matches.is_matched(row))
}

fn foreign_key_error(
    failed: usize,
    kind: VerifyExistenceKind,
    index: Option<&dyn Index>,
    probe: &RecordBatch,
) -> Error {
    let Some(index) = index else {
        return Error::Internal("no index covers the foreign key's destination columns".into());
    };
    let key = index.generate_error_key_name(probe, failed);
    Error::ConstraintError(index.constraint_error_message(kind, &key))
}

impl DataTable {
    /// Verify every constraint against an append chunk.
    ///
    /// A conflict manager is provided when the caller opted into ON CONFLICT
    /// semantics: conflicts on target-matching unique indexes are captured,
    /// conflicts on any other unique index still raise.
    pub fn verify_append_constraints(
        &self,
        session: &Session,
        chunk: &RecordBatch,
        mut conflict_manager: Option<&mut ConflictManager>,
    ) -> Result<()> {
        let table_name = self.info().table_name().to_string();
        let mut rows: Option<Vec<Vec<Value>>> = None;

        // Generated columns: surface expression failures at insert time
        // rather than at every later read.
        for column in self.column_definitions() {
            let Some(generated) = column.generated_column() else {
                continue;
            };
            if rows.is_none() {
                rows = Some(convert::batch_rows(chunk)?);
            }
            for row in rows.as_ref().unwrap() {
                match generated.expr.eval(row) {
                    Ok(_) => {}
                    // Internal failures indicate bugs and propagate unwrapped.
                    Err(error @ Error::Internal(_)) => return Err(error),
                    Err(error) => {
                        return Err(Error::ConstraintError(format!(
                            "Incorrect value for generated column \"{} {:?} AS ({})\": {error}",
                            column.name(),
                            column.data_type(),
                            generated.text
                        )));
                    }
                }
            }
        }

        for constraint in self.constraints() {
            if let BoundConstraint::NotNull {
                column,
                column_name,
            } = constraint
            {
                verify_not_null_vector(&table_name, column_name, chunk.column(*column).as_ref())?;
            }
        }

        for constraint in self.constraints() {
            if let BoundConstraint::Check { expr, .. } = constraint {
                if rows.is_none() {
                    rows = Some(convert::batch_rows(chunk)?);
                }
                verify_check_rows(&table_name, expr, rows.as_ref().unwrap())?;
            }
        }

        let has_unique = self
            .constraints()
            .iter()
            .any(|constraint| matches!(constraint, BoundConstraint::Unique { .. }));
        if has_unique {
            self.verify_unique_indexes(chunk, conflict_manager.as_deref_mut())?;
        }

        for constraint in self.constraints() {
            if let BoundConstraint::ForeignKey(fk) = constraint {
                if matches!(
                    fk.kind,
                    ForeignKeyKind::ForeignKeyTable | ForeignKeyKind::SelfReferenceTable
                ) {
                    self.verify_foreign_key_constraint(
                        fk,
                        session,
                        chunk,
                        VerifyExistenceKind::AppendFk,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn verify_unique_indexes(
        &self,
        chunk: &RecordBatch,
        conflict_manager: Option<&mut ConflictManager>,
    ) -> Result<()> {
        let indexes = self.info().indexes();
        match conflict_manager {
            Some(manager) => {
                // First pass: capture conflicts on the indexes matching the
                // conflict target.
                manager.set_mode(ConflictMode::Scan);
                indexes.scan(|index| {
                    if !index.is_unique() {
                        return Ok(false);
                    }
                    let matches_target = manager
                        .conflict_target()
                        .is_some_and(|target| target.matches_index(index.as_ref()));
                    if matches_target {
                        index.verify_append(chunk, manager)?;
                    }
                    Ok(false)
                })?;
                // Second pass: conflicts on the remaining unique indexes are
                // hard errors.
                manager.set_mode(ConflictMode::Throw);
                indexes.scan(|index| {
                    if !index.is_unique() {
                        return Ok(false);
                    }
                    let matches_target = manager
                        .conflict_target()
                        .is_some_and(|target| target.matches_index(index.as_ref()));
                    if !matches_target {
                        index.verify_append(chunk, manager)?;
                    }
                    Ok(false)
                })?;
            }
            None => {
                let mut manager =
                    ConflictManager::new(VerifyExistenceKind::Append, chunk.num_rows());
                indexes.scan(|index| {
                    if index.is_unique() {
                        index.verify_append(chunk, &mut manager)?;
                    }
                    Ok(false)
                })?;
            }
        }
        Ok(())
    }

    /// Verify constraints against an update chunk restricted to the updated
    /// columns. UNIQUE and FOREIGN KEY are skipped: the planner rewrites
    /// updates of constrained columns into delete + insert, and that
    /// precondition is enforced below.
    pub(crate) fn verify_update_constraints(
        &self,
        updates: &RecordBatch,
        column_ids: &[usize],
    ) -> Result<()> {
        let table_name = self.info().table_name().to_string();
        for constraint in self.constraints() {
            match constraint {
                BoundConstraint::NotNull {
                    column,
                    column_name,
                } => {
                    for (position, &updated) in column_ids.iter().enumerate() {
                        if updated == *column {
                            verify_not_null_vector(
                                &table_name,
                                column_name,
                                updates.column(position).as_ref(),
                            )?;
                            break;
                        }
                    }
                }
                BoundConstraint::Check {
                    expr,
                    bound_columns,
                } => {
                    if let Some(mock_rows) = build_mock_rows(
                        self.physical_column_count(),
                        column_ids,
                        bound_columns,
                        updates,
                    )? {
                        verify_check_rows(&table_name, expr, &mock_rows)?;
                    }
                }
                BoundConstraint::Unique { .. } | BoundConstraint::ForeignKey(_) => {}
            }
        }
        let touches_index = self
            .info()
            .indexes()
            .scan(|index| Ok(index.index_is_updated(column_ids)))?;
        if touches_index {
            return Err(Error::Internal(
                "update touches an indexed column; the planner must rewrite it into \
                 delete + insert"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Verify constraints against a delete chunk: only inbound foreign keys
    /// apply.
    pub(crate) fn verify_delete_constraints(
        &self,
        session: &Session,
        chunk: &RecordBatch,
    ) -> Result<()> {
        for constraint in self.constraints() {
            match constraint {
                BoundConstraint::NotNull { .. }
                | BoundConstraint::Check { .. }
                | BoundConstraint::Unique { .. } => {}
                BoundConstraint::ForeignKey(fk) => {
                    if matches!(
                        fk.kind,
                        ForeignKeyKind::PrimaryKeyTable | ForeignKeyKind::SelfReferenceTable
                    ) {
                        self.verify_foreign_key_constraint(
                            fk,
                            session,
                            chunk,
                            VerifyExistenceKind::DeleteFk,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Probe a foreign-key relationship against the referenced table's
    /// committed index and the current transaction's local index for it.
    ///
    /// Appends succeed when every input key exists in at least one of the
    /// two stores; deletes succeed when no input key exists in either.
    fn verify_foreign_key_constraint(
        &self,
        fk: &BoundForeignKey,
        session: &Session,
        chunk: &RecordBatch,
        kind: VerifyExistenceKind,
    ) -> Result<()> {
        debug_assert!(matches!(
            kind,
            VerifyExistenceKind::AppendFk | VerifyExistenceKind::DeleteFk
        ));
        let is_append = kind == VerifyExistenceKind::AppendFk;
        let (src_keys, dst_keys) = if is_append {
            (&fk.fk_keys, &fk.pk_keys)
        } else {
            (&fk.pk_keys, &fk.fk_keys)
        };
        let referenced = session.catalog().get(&fk.schema, &fk.table).ok_or_else(|| {
            Error::Internal(format!(
                "Can't find table \"{}\" in foreign key constraint",
                fk.table
            ))
        })?;
        let count = chunk.num_rows();
        if count == 0 {
            return Ok(());
        }

        // Probe chunk over the referenced table's physical layout, aliasing
        // the source key columns into the destination positions.
        let schema = referenced.physical_schema();
        let mut columns: Vec<ArrayRef> = schema
            .fields()
            .iter()
            .map(|field| new_null_array(field.data_type(), count))
            .collect();
        for (&src, &dst) in src_keys.iter().zip(dst_keys.iter()) {
            columns[dst] = chunk.column(src).clone();
        }
        let probe = RecordBatch::try_new(schema, columns)?;

        let index_side = if is_append {
            ForeignKeyKind::PrimaryKeyTable
        } else {
            ForeignKeyKind::ForeignKeyTable
        };

        let mut regular = ConflictManager::new(kind, count);
        regular.set_mode(ConflictMode::Scan);
        referenced
            .info()
            .indexes()
            .verify_foreign_key(dst_keys, index_side, &probe, &mut regular)?;
        regular.finalize();
        let error = is_foreign_key_error(is_append, count, &regular);

        // Only the current transaction's local store participates.
        let local_entry = session.local_storage().find(&referenced);
        let mut transaction = ConflictManager::new(kind, count);
        transaction.set_mode(ConflictMode::Scan);
        let mut transaction_error = false;
        if let Some(entry) = &local_entry {
            entry
                .indexes()
                .verify_foreign_key(dst_keys, index_side, &probe, &mut transaction)?;
            transaction.finalize();
            transaction_error = is_foreign_key_error(is_append, count, &transaction);
        }

        if !error && !transaction_error {
            return Ok(());
        }

        let index = referenced
            .info()
            .indexes()
            .find_foreign_key_index(dst_keys, index_side);
        let transaction_index = local_entry
            .as_ref()
            .and_then(|entry| entry.indexes().find_foreign_key_index(dst_keys, index_side));

        if local_entry.is_none() {
            // Only committed storage was checked.
            debug_assert!(error);
            let failed = locate_error_index(is_append, count, &regular).ok_or_else(|| {
                Error::Internal("foreign key violation without an offending row".into())
            })?;
            return Err(foreign_key_error(failed, kind, index.as_deref(), &probe));
        }

        if transaction_error && error && is_append {
            // Union semantics: an append fails only for inputs present in
            // neither the committed nor the transaction-local store.
            for row in 0..count {
                if !regular.is_matched(row) && !transaction.is_matched(row) {
                    return Err(foreign_key_error(row, kind, index.as_deref(), &probe));
                }
            }
            return Ok(());
        }

        if !is_append {
            if error {
                let failed = locate_error_index(false, count, &regular).ok_or_else(|| {
                    Error::Internal("foreign key violation without an offending row".into())
                })?;
                return Err(foreign_key_error(failed, kind, index.as_deref(), &probe));
            }
            debug_assert!(transaction_error);
            let failed = locate_error_index(false, count, &transaction).ok_or_else(|| {
                Error::Internal("foreign key violation without an offending row".into())
            })?;
            return Err(foreign_key_error(
                failed,
                kind,
                transaction_index.as_deref(),
                &probe,
            ));
        }

        // Append with exactly one store in error: the other store matched
        // every input, so the union is satisfied.
        Ok(())
    }
}
