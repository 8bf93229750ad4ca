use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::data_table::DataTable;

/// Name-to-table registry standing in for the catalog service.
///
/// Holds the *current* version of each table. Schema evolution produces a
/// successor `DataTable`; `replace` atomically swaps it in while the
/// demoted predecessor keeps rejecting writes through its root flag.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<FxHashMap<(String, String), Arc<DataTable>>>,
}

impl Catalog {
    pub fn new() -> Arc<Catalog> {
        Arc::new(Catalog::default())
    }

    fn key(table: &DataTable) -> (String, String) {
        (
            table.info().schema_name().to_string(),
            table.info().table_name().to_string(),
        )
    }

    pub fn register(&self, table: Arc<DataTable>) {
        self.tables
            .write()
            .unwrap()
            .insert(Self::key(&table), table);
    }

    /// Swap in a successor version under the same coordinates.
    pub fn replace(&self, table: Arc<DataTable>) {
        self.register(table);
    }

    pub fn get(&self, schema: &str, name: &str) -> Option<Arc<DataTable>> {
        self.tables
            .read()
            .unwrap()
            .get(&(schema.to_string(), name.to_string()))
            .cloned()
    }

    pub fn drop_table(&self, schema: &str, name: &str) -> Option<Arc<DataTable>> {
        self.tables
            .write()
            .unwrap()
            .remove(&(schema.to_string(), name.to_string()))
    }
}
