//! The storage port: abstract read/write/delete of entity records by id.
//!
//! A backend stores JSON records in "tables" selected from the id's type
//! prefix by a configurable mapper. The port is non-transactional;
//! atomicity is scoped to a single record. Errors classify as transient
//! (retried once by the persistence layer) or fatal (surfaced).

mod fs;
mod mem;

pub use fs::FsStore;
pub use mem::MemStore;

use models::Id;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

/// Maps an entity id to the storage table holding its record.
/// The default mapper assigns one table per type prefix.
pub type TableMapper = Arc<dyn Fn(&Id) -> String + Send + Sync>;

pub fn default_table_mapper() -> TableMapper {
    Arc::new(|id: &Id| id.kind().table().to_string())
}

/// A mapper with per-prefix table-name overrides (keys are single type
/// letters, any case); unlisted prefixes keep the default mapping.
pub fn table_mapper_with(
    overrides: std::collections::BTreeMap<String, String>,
) -> TableMapper {
    let overrides: std::collections::BTreeMap<String, String> = overrides
        .into_iter()
        .map(|(prefix, table)| (prefix.to_ascii_uppercase(), table))
        .collect();
    Arc::new(move |id: &Id| {
        let prefix = id.kind().prefix().to_string();
        overrides
            .get(&prefix)
            .cloned()
            .unwrap_or_else(|| id.kind().table().to_string())
    })
}

/// The storage port. Write semantics are upsert; a read of an absent id
/// returns `None` rather than an error.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn open(&self) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;

    async fn read(&self, id: &Id) -> Result<Option<serde_json::Value>, StoreError>;
    async fn write(&self, id: &Id, record: serde_json::Value) -> Result<(), StoreError>;
    async fn delete(&self, id: &Id) -> Result<(), StoreError>;
}
