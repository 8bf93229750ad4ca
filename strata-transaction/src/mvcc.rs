use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

/// Transaction ID type.
pub type TxnId = u64;

/// Transaction ID representing "no transaction" or "not deleted".
pub const TXN_ID_NONE: TxnId = TxnId::MAX;

/// Creator of rows loaded from persistent data. Always committed.
pub const TXN_ID_BOOTSTRAP: TxnId = 0;

/// Commit status of an allocated transaction or commit identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct TxnIdManagerInner {
    /// Next identifier to allocate (transactions and commit ids share it).
    next_id: AtomicU64,
    /// Largest committed identifier; acts as the snapshot watermark.
    last_committed: AtomicU64,
    statuses: Mutex<FxHashMap<TxnId, TxnStatus>>,
}

/// Allocates transaction and commit identifiers and tracks their status.
///
/// Cloning is cheap; all clones share the same allocator state.
#[derive(Clone, Debug)]
pub struct TxnIdManager {
    inner: Arc<TxnIdManagerInner>,
}

impl TxnIdManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TxnIdManagerInner {
                next_id: AtomicU64::new(TXN_ID_BOOTSTRAP + 1),
                last_committed: AtomicU64::new(TXN_ID_BOOTSTRAP),
                statuses: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Begin a transaction: allocate an id and snapshot the watermark.
    pub fn begin(&self) -> Transaction {
        let txn_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let snapshot_id = self.inner.last_committed.load(Ordering::SeqCst);
        self.inner
            .statuses
            .lock()
            .unwrap()
            .insert(txn_id, TxnStatus::Active);
        Transaction {
            snapshot: TransactionSnapshot {
                txn_id,
                snapshot_id,
            },
            manager: self.clone(),
        }
    }

    /// Reserve a fresh identifier under which an append will be published.
    pub fn allocate_commit_id(&self) -> TxnId {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Mark an identifier committed and advance the watermark past it.
    pub fn mark_committed(&self, id: TxnId) {
        self.inner
            .statuses
            .lock()
            .unwrap()
            .insert(id, TxnStatus::Committed);
        self.inner.last_committed.fetch_max(id, Ordering::SeqCst);
    }

    pub fn mark_aborted(&self, id: TxnId) {
        self.inner
            .statuses
            .lock()
            .unwrap()
            .insert(id, TxnStatus::Aborted);
    }

    pub fn is_committed(&self, id: TxnId) -> bool {
        if id == TXN_ID_BOOTSTRAP {
            return true;
        }
        matches!(
            self.inner.statuses.lock().unwrap().get(&id),
            Some(TxnStatus::Committed)
        )
    }

    pub fn last_committed(&self) -> TxnId {
        self.inner.last_committed.load(Ordering::SeqCst)
    }

    /// Whether a row stamped with `created_by`/`deleted_by` is visible to
    /// `snapshot`.
    ///
    /// A row is visible when its creator is the snapshot's own transaction,
    /// or committed at or below the snapshot watermark; and it has not been
    /// deleted by the snapshot's own transaction or by a transaction
    /// committed at or below the watermark.
    pub fn row_visible(
        &self,
        snapshot: &TransactionSnapshot,
        created_by: TxnId,
        deleted_by: TxnId,
    ) -> bool {
        let created_visible = created_by == snapshot.txn_id
            || (created_by <= snapshot.snapshot_id && self.is_committed(created_by));
        if !created_visible {
            return false;
        }
        if deleted_by == TXN_ID_NONE {
            return true;
        }
        let deleted_visible = deleted_by == snapshot.txn_id
            || (deleted_by <= snapshot.snapshot_id && self.is_committed(deleted_by));
        !deleted_visible
    }
}

impl Default for TxnIdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of a transaction's identity and snapshot watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionSnapshot {
    pub txn_id: TxnId,
    pub snapshot_id: TxnId,
}

/// A live transaction handle.
#[derive(Clone, Debug)]
pub struct Transaction {
    snapshot: TransactionSnapshot,
    manager: TxnIdManager,
}

impl Transaction {
    #[inline]
    pub fn id(&self) -> TxnId {
        self.snapshot.txn_id
    }

    #[inline]
    pub fn snapshot(&self) -> TransactionSnapshot {
        self.snapshot
    }

    #[inline]
    pub fn manager(&self) -> &TxnIdManager {
        &self.manager
    }
}
