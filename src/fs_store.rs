use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::client::{BlobStore, ClientError};

/// Blob store over a local directory: `{root}/{bucket}/{key}`. Writes go to
/// a temporary sibling first and are renamed into place, so a reader never
/// sees a half-written object.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ClientError> {
        let relative = Path::new(bucket).join(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ClientError::new(format!("invalid object key {bucket}/{key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ClientError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), bytes = bytes.len(), content_type, "object written");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ClientError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ClientError::with_source(format!("read {} failed", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store.put("extracted-data", "temp/seats.csv", b"v1".to_vec(), "application/csv").await.unwrap();
        store.put("extracted-data", "temp/seats.csv", b"v2".to_vec(), "application/csv").await.unwrap();

        assert_eq!(store.get("extracted-data", "temp/seats.csv").await.unwrap(), b"v2");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("extracted-data/temp"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        assert!(store.get("extracted-data", "../secrets").await.is_err());
        assert!(store.get("extracted-data", "temp/missing.csv").await.is_err());
    }
}
