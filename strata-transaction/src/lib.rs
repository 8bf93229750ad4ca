//! Transaction management and MVCC visibility for Strata.
//!
//! Each transaction operates with a consistent snapshot of the database,
//! determined by its transaction id and a snapshot watermark taken at begin
//! time. Rows carry `created_by`/`deleted_by` transaction identifiers; the
//! visibility rules in [`TxnIdManager::row_visible`] decide what each
//! snapshot observes.
//!
//! # Reserved identifiers
//!
//! - [`TXN_ID_NONE`] (`u64::MAX`): "no transaction"; marks a row as not
//!   deleted.
//! - [`TXN_ID_BOOTSTRAP`] (0): creator of rows loaded from persistent data;
//!   always committed.
//!
//! Commit identifiers are allocated from the same monotone counter as
//! transaction identifiers, so any snapshot taken after a commit covers it.

#![forbid(unsafe_code)]

pub mod mvcc;

pub use mvcc::{
    TXN_ID_BOOTSTRAP, TXN_ID_NONE, Transaction, TransactionSnapshot, TxnId, TxnIdManager,
    TxnStatus,
};
