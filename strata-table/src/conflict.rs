use rustc_hash::FxHashSet;

use crate::index::Index;

/// What an index probe is verifying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyExistenceKind {
    /// Uniqueness probe during append: a match is a duplicate key.
    Append,
    /// Foreign-key probe during append: every input must match.
    AppendFk,
    /// Foreign-key probe during delete: no input may match.
    DeleteFk,
}

/// Whether a probe records conflicts or raises on the first one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictMode {
    Scan,
    Throw,
}

/// The column set named by an ON CONFLICT clause.
#[derive(Clone, Debug)]
pub struct ConflictTarget {
    columns: FxHashSet<usize>,
}

impl ConflictTarget {
    pub fn new(columns: impl IntoIterator<Item = usize>) -> ConflictTarget {
        ConflictTarget {
            columns: columns.into_iter().collect(),
        }
    }

    /// An index matches the conflict target when it covers exactly the
    /// target's column set.
    pub fn matches_index(&self, index: &dyn Index) -> bool {
        let index_columns = index.column_ids();
        index_columns.len() == self.columns.len()
            && index_columns.iter().all(|id| self.columns.contains(id))
    }
}

/// Scratch structure capturing which input rows matched during an index
/// probe.
///
/// In scan mode matches accumulate; in throw mode the probing index raises a
/// constraint error on the first conflict. `finalize` freezes the matches
/// into an ordered set for interpretation.
#[derive(Debug)]
pub struct ConflictManager {
    kind: VerifyExistenceKind,
    mode: ConflictMode,
    matched: Vec<bool>,
    conflicts: Vec<usize>,
    finalized: bool,
    target: Option<ConflictTarget>,
}

impl ConflictManager {
    pub fn new(kind: VerifyExistenceKind, input_count: usize) -> ConflictManager {
        ConflictManager {
            kind,
            mode: ConflictMode::Throw,
            matched: vec![false; input_count],
            conflicts: Vec::new(),
            finalized: false,
            target: None,
        }
    }

    pub fn with_conflict_target(mut self, target: ConflictTarget) -> ConflictManager {
        self.target = Some(target);
        self
    }

    pub fn kind(&self) -> VerifyExistenceKind {
        self.kind
    }

    pub fn mode(&self) -> ConflictMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ConflictMode) {
        self.mode = mode;
    }

    pub fn conflict_target(&self) -> Option<&ConflictTarget> {
        self.target.as_ref()
    }

    pub fn input_count(&self) -> usize {
        self.matched.len()
    }

    /// Record that input row `index` matched an existing key.
    pub fn record_match(&mut self, index: usize) {
        debug_assert!(!self.finalized, "conflict manager already finalized");
        self.matched[index] = true;
    }

    /// Freeze matches into the ordered conflict set.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.conflicts = self
            .matched
            .iter()
            .enumerate()
            .filter_map(|(index, &hit)| hit.then_some(index))
            .collect();
        self.finalized = true;
    }

    /// Ordered input positions that matched. Valid after `finalize`.
    pub fn conflicts(&self) -> &[usize] {
        debug_assert!(self.finalized, "conflict manager not finalized");
        &self.conflicts
    }

    pub fn match_count(&self) -> usize {
        self.matched.iter().filter(|&&hit| hit).count()
    }

    pub fn is_matched(&self, index: usize) -> bool {
        self.matched[index]
    }
}
