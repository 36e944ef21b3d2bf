use std::sync::Arc;

use mirror_common::item::Item;
use mirror_common::storage::{Storage, StorageError, INSERT_ITEM};

/// Writes fetched items to storage, one row per item.
///
/// Delivering the same item twice is not expected, but if it happens the storage's
/// constraint handling decides the outcome: `PgStorage` rejects it with
/// `StorageError::Duplicate` and leaves the stored row as it was.
#[derive(Clone)]
pub struct ItemSink {
    storage: Arc<dyn Storage>,
    statement: String,
}

impl ItemSink {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_statement(storage, INSERT_ITEM)
    }

    pub fn with_statement(storage: Arc<dyn Storage>, statement: &str) -> Self {
        Self {
            storage,
            statement: statement.to_owned(),
        }
    }

    pub async fn store(&self, item: &Item) -> Result<(), StorageError> {
        self.storage.execute(&self.statement, item).await
    }
}
