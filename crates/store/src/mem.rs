use crate::{default_table_mapper, Store, StoreError, TableMapper};
use models::Id;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory backend for tests and single-process runs.
pub struct MemStore {
    tables: Mutex<HashMap<String, HashMap<Id, serde_json::Value>>>,
    mapper: TableMapper,
    fail_writes: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_mapper(default_table_mapper())
    }

    pub fn with_mapper(mapper: TableMapper) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            mapper,
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` writes fail with a transient error.
    /// Exercises the retry path in tests.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Records currently held in the table owning `id`'s prefix.
    pub fn table_len(&self, id: &Id) -> usize {
        let tables = self.tables.lock().unwrap();
        tables
            .get(&(self.mapper)(id))
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn take_fault(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn open(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read(&self, id: &Id) -> Result<Option<serde_json::Value>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&(self.mapper)(id))
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn write(&self, id: &Id, record: serde_json::Value) -> Result<(), StoreError> {
        if self.take_fault() {
            return Err(StoreError::Transient("injected write fault".to_string()));
        }
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry((self.mapper)(id))
            .or_default()
            .insert(id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &Id) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(&(self.mapper)(id)) {
            table.remove(id);
        }
        Ok(())
    }
}
