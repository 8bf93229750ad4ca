use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::array::RecordBatch;

/// One write-ahead-log record.
#[derive(Clone, Debug)]
pub enum WalRecord {
    SetTable { schema: String, table: String },
    Insert { chunk: RecordBatch },
}

/// Write-ahead log facade.
///
/// The table layer streams committed appends through it; durability is the
/// log implementation's concern. This in-memory sink records everything for
/// inspection and honors the `skip_writing` switch used by temporary tables
/// and replay.
#[derive(Debug, Default)]
pub struct WriteAheadLog {
    skip_writing: AtomicBool,
    records: Mutex<Vec<WalRecord>>,
}

impl WriteAheadLog {
    pub fn new() -> WriteAheadLog {
        WriteAheadLog::default()
    }

    pub fn skip_writing(&self) -> bool {
        self.skip_writing.load(Ordering::Relaxed)
    }

    pub fn set_skip_writing(&self, skip: bool) {
        self.skip_writing.store(skip, Ordering::Relaxed);
    }

    pub fn write_set_table(&self, schema: &str, table: &str) {
        self.records.lock().unwrap().push(WalRecord::SetTable {
            schema: schema.to_string(),
            table: table.to_string(),
        });
    }

    pub fn write_insert(&self, chunk: RecordBatch) {
        self.records
            .lock()
            .unwrap()
            .push(WalRecord::Insert { chunk });
    }

    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().unwrap().clone()
    }
}
