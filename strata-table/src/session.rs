use std::sync::Arc;

use tracing::debug;

use strata_result::Result;
use strata_transaction::{Transaction, TxnIdManager};

use crate::catalog::Catalog;
use crate::local_storage::LocalStorage;
use crate::wal::WriteAheadLog;

/// Per-session tuning and debug switches.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionConfig {
    /// Shrink parallel-scan work units to a single vector so parallelism
    /// bugs reproduce with small tables.
    pub verify_parallelism: bool,
}

/// One transaction's execution context: the transaction handle, its local
/// store, and the shared catalog and write-ahead log.
pub struct Session {
    txn: Transaction,
    local: LocalStorage,
    catalog: Arc<Catalog>,
    wal: Arc<WriteAheadLog>,
    config: SessionConfig,
}

impl Session {
    pub fn begin(
        manager: &TxnIdManager,
        catalog: Arc<Catalog>,
        wal: Arc<WriteAheadLog>,
    ) -> Session {
        Session::begin_with_config(manager, catalog, wal, SessionConfig::default())
    }

    pub fn begin_with_config(
        manager: &TxnIdManager,
        catalog: Arc<Catalog>,
        wal: Arc<WriteAheadLog>,
        config: SessionConfig,
    ) -> Session {
        Session {
            txn: manager.begin(),
            local: LocalStorage::default(),
            catalog,
            wal,
            config,
        }
    }

    pub fn txn(&self) -> &Transaction {
        &self.txn
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Commit: flush the local store through the global append pipeline and
    /// publish under a fresh commit identifier.
    ///
    /// On failure every table flush is reverted and the transaction aborts;
    /// rows already stamped with the unpublished commit identifier stay
    /// invisible to every snapshot.
    pub fn commit(self) -> Result<()> {
        let manager = self.txn.manager().clone();
        let commit_id = manager.allocate_commit_id();
        match self.local.commit(&self.txn, commit_id, &self.wal) {
            Ok(()) => {
                manager.mark_committed(self.txn.id());
                manager.mark_committed(commit_id);
                debug!(txn_id = self.txn.id(), commit_id, "transaction committed");
                Ok(())
            }
            Err(error) => {
                manager.mark_aborted(self.txn.id());
                debug!(txn_id = self.txn.id(), %error, "transaction aborted at commit");
                Err(error)
            }
        }
    }

    /// Abort: discard the local store and mark the transaction aborted.
    pub fn rollback(self) {
        self.txn.manager().mark_aborted(self.txn.id());
        debug!(txn_id = self.txn.id(), "transaction rolled back");
    }
}
