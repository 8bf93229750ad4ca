use std::sync::{Arc, Mutex, RwLock};

use arrow::array::RecordBatch;
use rustc_hash::FxHashMap;

use strata_expr::{IndexKey, Value, convert};
use strata_result::{Error, Result};
use strata_store::RowId;

use crate::conflict::{ConflictManager, ConflictMode, VerifyExistenceKind};
use crate::constraint::ForeignKeyKind;

/// Capability set every secondary index exposes to the table layer.
///
/// Chunks handed to an index are laid out in the owning table's physical
/// column order; the index extracts its key columns by storage ordinal.
pub trait Index: Send + Sync {
    fn name(&self) -> &str;

    /// Physical storage ordinals of the key columns.
    fn column_ids(&self) -> &[usize];

    fn is_unique(&self) -> bool;

    fn is_foreign(&self) -> bool;

    /// Insert entries for every row. Fails atomically: on a constraint
    /// violation no entry of this chunk remains in the index.
    fn append(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()>;

    /// Remove entries. Missing entries are ignored, so rollback paths can
    /// delete ranges that were only partially inserted.
    fn delete(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()>;

    /// Probe for duplicate keys. In scan mode conflicts are recorded in the
    /// manager; in throw mode the first conflict raises.
    fn verify_append(&self, chunk: &RecordBatch, conflict: &mut ConflictManager) -> Result<()>;

    /// Probe for foreign-key matches. `keys` names the destination key
    /// ordinals and must cover this index's columns.
    fn verify_foreign_key(
        &self,
        keys: &[usize],
        chunk: &RecordBatch,
        conflict: &mut ConflictManager,
    ) -> Result<()>;

    /// Render the key of `row` for a constraint error message.
    fn generate_error_key_name(&self, chunk: &RecordBatch, row: usize) -> String;

    fn constraint_error_message(&self, kind: VerifyExistenceKind, key: &str) -> String;

    /// Whether an update touching `column_ids` would have to maintain this
    /// index.
    fn index_is_updated(&self, column_ids: &[usize]) -> bool {
        column_ids.iter().any(|id| self.column_ids().contains(id))
    }
}

/// An index fills a given foreign-key role when it carries the required flag
/// (unique for the primary-key side, foreign for the foreign-key side) and
/// its column ordinals equal the supplied key ordinals as a set.
pub fn is_foreign_key_index(fk_keys: &[usize], index: &dyn Index, kind: ForeignKeyKind) -> bool {
    let flag = match kind {
        ForeignKeyKind::PrimaryKeyTable => index.is_unique(),
        ForeignKeyKind::ForeignKeyTable => index.is_foreign(),
        ForeignKeyKind::SelfReferenceTable => return false,
    };
    if !flag || fk_keys.len() != index.column_ids().len() {
        return false;
    }
    fk_keys
        .iter()
        .all(|key| index.column_ids().contains(key))
}

/// The set of indexes attached to one table, shared by all its versions.
#[derive(Default)]
pub struct TableIndexList {
    indexes: Mutex<Vec<Arc<dyn Index>>>,
}

impl std::fmt::Debug for TableIndexList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableIndexList")
            .field("count", &self.count())
            .finish()
    }
}

impl TableIndexList {
    pub fn is_empty(&self) -> bool {
        self.indexes.lock().unwrap().is_empty()
    }

    pub fn count(&self) -> usize {
        self.indexes.lock().unwrap().len()
    }

    pub fn add(&self, index: Arc<dyn Index>) {
        self.indexes.lock().unwrap().push(index);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Index>> {
        self.indexes.lock().unwrap().clone()
    }

    /// Iterate the indexes. The callback returning `Ok(true)` short-circuits
    /// the scan; the overall result tells whether it did.
    pub fn scan<F>(&self, mut f: F) -> Result<bool>
    where
        F: FnMut(&Arc<dyn Index>) -> Result<bool>,
    {
        let snapshot = self.snapshot();
        for index in &snapshot {
            if f(index)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Probe the index covering the destination keys of a foreign-key
    /// relationship.
    pub fn verify_foreign_key(
        &self,
        keys: &[usize],
        kind: ForeignKeyKind,
        chunk: &RecordBatch,
        conflict: &mut ConflictManager,
    ) -> Result<()> {
        let index = self.find_foreign_key_index(keys, kind).ok_or_else(|| {
            Error::Internal("no index covers the foreign key's destination columns".into())
        })?;
        index.verify_foreign_key(keys, chunk, conflict)
    }

    pub fn find_foreign_key_index(
        &self,
        keys: &[usize],
        kind: ForeignKeyKind,
    ) -> Option<Arc<dyn Index>> {
        self.indexes
            .lock()
            .unwrap()
            .iter()
            .find(|index| is_foreign_key_index(keys, index.as_ref(), kind))
            .cloned()
    }
}

/// In-memory index keyed on canonical key values.
///
/// Serves both roles the table layer needs: unique indexes (primary keys,
/// UNIQUE constraints) and foreign-key indexes on the referencing side.
pub struct HashIndex {
    name: String,
    column_ids: Vec<usize>,
    unique: bool,
    foreign: bool,
    entries: RwLock<FxHashMap<IndexKey, Vec<RowId>>>,
}

impl HashIndex {
    pub fn new(
        name: impl Into<String>,
        column_ids: Vec<usize>,
        unique: bool,
        foreign: bool,
    ) -> HashIndex {
        HashIndex {
            name: name.into(),
            column_ids,
            unique,
            foreign,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn unique_index(name: impl Into<String>, column_ids: Vec<usize>) -> HashIndex {
        HashIndex::new(name, column_ids, true, false)
    }

    pub fn foreign_key_index(name: impl Into<String>, column_ids: Vec<usize>) -> HashIndex {
        HashIndex::new(name, column_ids, false, true)
    }

    /// Key of `row` over `columns` in the chunk. `None` when any component
    /// is NULL: such rows never participate in uniqueness or FK matching.
    fn key_at(
        chunk: &RecordBatch,
        columns: &[usize],
        row: usize,
    ) -> Result<Option<IndexKey>> {
        let mut values = Vec::with_capacity(columns.len());
        for &column in columns {
            values.push(convert::value_at(chunk.column(column).as_ref(), row)?);
        }
        Ok(IndexKey::composite(&values))
    }

    fn keys_for_chunk(&self, chunk: &RecordBatch) -> Result<Vec<Option<IndexKey>>> {
        (0..chunk.num_rows())
            .map(|row| Self::key_at(chunk, &self.column_ids, row))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn contains_row(&self, row_id: RowId) -> bool {
        self.entries
            .read()
            .unwrap()
            .values()
            .any(|rows| rows.contains(&row_id))
    }

    pub fn contains_key(&self, values: &[Value]) -> bool {
        match IndexKey::composite(values) {
            Some(key) => self
                .entries
                .read()
                .unwrap()
                .get(&key)
                .is_some_and(|rows| !rows.is_empty()),
            None => false,
        }
    }
}

impl Index for HashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn column_ids(&self) -> &[usize] {
        &self.column_ids
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn is_foreign(&self) -> bool {
        self.foreign
    }

    fn append(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert_eq!(chunk.num_rows(), row_ids.len());
        let keys = self.keys_for_chunk(chunk)?;
        let mut entries = self.entries.write().unwrap();
        if self.unique {
            // Check the whole chunk before touching the map so a violation
            // leaves no partial entries behind.
            let mut incoming: FxHashMap<&IndexKey, usize> = FxHashMap::default();
            for (row, key) in keys.iter().enumerate() {
                let Some(key) = key else { continue };
                let duplicate = entries.get(key).is_some_and(|rows| !rows.is_empty())
                    || incoming.insert(key, row).is_some();
                if duplicate {
                    let key_name = self.generate_error_key_name(chunk, row);
                    return Err(Error::ConstraintError(
                        self.constraint_error_message(VerifyExistenceKind::Append, &key_name),
                    ));
                }
            }
        }
        for (key, &row_id) in keys.into_iter().zip(row_ids) {
            if let Some(key) = key {
                entries.entry(key).or_default().push(row_id);
            }
        }
        Ok(())
    }

    fn delete(&self, chunk: &RecordBatch, row_ids: &[RowId]) -> Result<()> {
        debug_assert_eq!(chunk.num_rows(), row_ids.len());
        let keys = self.keys_for_chunk(chunk)?;
        let mut entries = self.entries.write().unwrap();
        for (key, &row_id) in keys.into_iter().zip(row_ids) {
            let Some(key) = key else { continue };
            if let Some(rows) = entries.get_mut(&key) {
                rows.retain(|&id| id != row_id);
                if rows.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn verify_append(&self, chunk: &RecordBatch, conflict: &mut ConflictManager) -> Result<()> {
        if !self.unique {
            return Ok(());
        }
        let keys = self.keys_for_chunk(chunk)?;
        let entries = self.entries.read().unwrap();
        for (row, key) in keys.iter().enumerate() {
            let Some(key) = key else { continue };
            if entries.get(key).is_some_and(|rows| !rows.is_empty()) {
                match conflict.mode() {
                    ConflictMode::Scan => conflict.record_match(row),
                    ConflictMode::Throw => {
                        let key_name = self.generate_error_key_name(chunk, row);
                        return Err(Error::ConstraintError(
                            self.constraint_error_message(VerifyExistenceKind::Append, &key_name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_foreign_key(
        &self,
        keys: &[usize],
        chunk: &RecordBatch,
        conflict: &mut ConflictManager,
    ) -> Result<()> {
        debug_assert!(
            keys.len() == self.column_ids.len()
                && keys.iter().all(|key| self.column_ids.contains(key)),
            "foreign-key probe does not cover this index's columns"
        );
        let probe_keys = self.keys_for_chunk(chunk)?;
        let entries = self.entries.read().unwrap();
        for (row, key) in probe_keys.iter().enumerate() {
            let Some(key) = key else {
                // A NULL key component satisfies an append vacuously and can
                // never be referenced, so only appends record it as a match.
                if conflict.kind() == VerifyExistenceKind::AppendFk {
                    conflict.record_match(row);
                }
                continue;
            };
            if entries.get(key).is_some_and(|rows| !rows.is_empty()) {
                match conflict.mode() {
                    ConflictMode::Scan => conflict.record_match(row),
                    ConflictMode::Throw => {
                        let key_name = self.generate_error_key_name(chunk, row);
                        return Err(Error::ConstraintError(
                            self.constraint_error_message(conflict.kind(), &key_name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn generate_error_key_name(&self, chunk: &RecordBatch, row: usize) -> String {
        let mut parts = Vec::with_capacity(self.column_ids.len());
        for &column in &self.column_ids {
            match convert::value_at(chunk.column(column).as_ref(), row) {
                Ok(value) => parts.push(value.to_string()),
                Err(_) => parts.push("?".to_string()),
            }
        }
        parts.join(", ")
    }

    fn constraint_error_message(&self, kind: VerifyExistenceKind, key: &str) -> String {
        match kind {
            VerifyExistenceKind::Append => format!(
                "Duplicate key \"{key}\" violates unique constraint \"{}\"",
                self.name
            ),
            VerifyExistenceKind::AppendFk => format!(
                "Violates foreign key constraint because key \"{key}\" does not exist in the \
                 referenced table"
            ),
            VerifyExistenceKind::DeleteFk => format!(
                "Violates foreign key constraint because key \"{key}\" is still referenced by a \
                 foreign key in a different table"
            ),
        }
    }
}

/// Insert a chunk into every index of a list, rolling back already-updated
/// indexes in reverse order when one of them fails. On failure the original
/// error is returned and no index retains any of the chunk's entries.
pub(crate) fn append_to_index_list(
    list: &TableIndexList,
    chunk: &RecordBatch,
    row_ids: &[RowId],
) -> Result<()> {
    let mut already_appended: Vec<Arc<dyn Index>> = Vec::new();
    let mut failure: Option<Error> = None;
    list.scan(|index| match index.append(chunk, row_ids) {
        Ok(()) => {
            already_appended.push(Arc::clone(index));
            Ok(false)
        }
        Err(error) => {
            failure = Some(error);
            Ok(true)
        }
    })?;
    if let Some(error) = failure {
        for index in already_appended.iter().rev() {
            index.delete(chunk, row_ids)?;
        }
        return Err(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn chunk(ids: &[i64], names: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef,
                Arc::new(StringArray::from(names.to_vec())) as ArrayRef,
            ],
        )
        .unwrap()
    }

    #[test]
    fn unique_append_rejects_duplicates_atomically() {
        let index = HashIndex::unique_index("pk", vec![0]);
        index.append(&chunk(&[1, 2], &["a", "b"]), &[0, 1]).unwrap();

        let err = index
            .append(&chunk(&[3, 2], &["c", "dup"]), &[2, 3])
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintError(_)));
        // The non-conflicting row of the failed chunk was not inserted.
        assert!(!index.contains_row(2));
        assert!(index.contains_row(0));
    }

    #[test]
    fn delete_tolerates_missing_entries() {
        let index = HashIndex::unique_index("pk", vec![0]);
        index.append(&chunk(&[1], &["a"]), &[0]).unwrap();
        index.delete(&chunk(&[1, 9], &["a", "zz"]), &[0, 5]).unwrap();
        assert_eq!(index.entry_count(), 0);
    }

    #[test]
    fn verify_append_scan_mode_records_conflicts() {
        let index = HashIndex::unique_index("pk", vec![0]);
        index.append(&chunk(&[1, 2], &["a", "b"]), &[0, 1]).unwrap();

        let probe = chunk(&[5, 1, 2], &["x", "a", "b"]);
        let mut manager = ConflictManager::new(VerifyExistenceKind::Append, probe.num_rows());
        manager.set_mode(ConflictMode::Scan);
        index.verify_append(&probe, &mut manager).unwrap();
        manager.finalize();
        assert_eq!(manager.conflicts(), &[1, 2]);
    }

    #[test]
    fn rollback_removes_entries_from_earlier_indexes() {
        let list = TableIndexList::default();
        let first = Arc::new(HashIndex::unique_index("first", vec![0]));
        let second = Arc::new(HashIndex::unique_index("second", vec![1]));
        list.add(first.clone() as Arc<dyn Index>);
        list.add(second.clone() as Arc<dyn Index>);

        // Seed a conflict in the second index only.
        second.append(&chunk(&[9], &["taken"]), &[100]).unwrap();

        let err = append_to_index_list(&list, &chunk(&[1], &["taken"]), &[0]).unwrap_err();
        assert!(matches!(err, Error::ConstraintError(_)));
        assert!(!first.contains_row(0));
        assert!(!second.contains_row(0));
    }
}
