use crate::{default_table_mapper, Store, StoreError, TableMapper};
use models::Id;
use std::path::PathBuf;

/// Filesystem backend: one JSON file per record, one directory per table,
/// under a configured root. Suitable for development clusters; production
/// deployments plug in their own driver behind the same port.
pub struct FsStore {
    root: PathBuf,
    mapper: TableMapper,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mapper: default_table_mapper(),
        }
    }

    pub fn with_mapper(root: impl Into<PathBuf>, mapper: TableMapper) -> Self {
        Self {
            root: root.into(),
            mapper,
        }
    }

    fn record_path(&self, id: &Id) -> PathBuf {
        self.root
            .join((self.mapper)(id))
            .join(format!("{id}.json"))
    }
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn open(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(StoreError::from_io)?;
        tracing::info!(root = %self.root.display(), "opened filesystem store");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read(&self, id: &Id) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.record_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::from_io(err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::Fatal(format!("corrupt record at {}: {err}", path.display())))
    }

    async fn write(&self, id: &Id, record: serde_json::Value) -> Result<(), StoreError> {
        let path = self.record_path(id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(StoreError::from_io)?;
        }
        // Write-then-rename keeps each record atomic under crash.
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(&record)
            .map_err(|err| StoreError::Fatal(err.to_string()))?;
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(StoreError::from_io)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(StoreError::from_io)
    }

    async fn delete(&self, id: &Id) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::from_io(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.open().await.unwrap();

        let id = Id::parse("PAB1").unwrap();
        store
            .write(&id, json!({"id": "PAB1", "class": "human"}))
            .await
            .unwrap();

        assert!(dir.path().join("players/PAB1.json").exists());
        assert_eq!(
            store.read(&id).await.unwrap(),
            Some(json!({"id": "PAB1", "class": "human"}))
        );

        store.delete(&id).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), None);
        // Deleting an absent record is not an error.
        store.delete(&id).await.unwrap();
    }
}
