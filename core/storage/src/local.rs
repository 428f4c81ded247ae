//! Filesystem-backed key-value store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{validate_key, KeyValueStore};
use lifetrack_common::Result;

/// Extension used for stored values.
const VALUE_EXTENSION: &str = "json";

/// Filesystem key-value store.
///
/// Each key maps to one file below the root directory; `/` in a key
/// becomes a subdirectory. Writes go to a temporary sibling first and are
/// renamed into place, so a crash mid-write never leaves a torn value.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn to_fs_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut components = key.split('/').peekable();
        while let Some(component) = components.next() {
            if components.peek().is_some() {
                path.push(component);
            } else {
                path.push(format!("{}.{}", component, VALUE_EXTENSION));
            }
        }
        path
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if path.is_dir() {
                self.collect_keys(&path, &format!("{}{}/", prefix, name), keys)?;
            } else if let Some(stem) = name.strip_suffix(&format!(".{}", VALUE_EXTENSION)) {
                keys.push(format!("{}{}", prefix, stem));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.to_fs_path(key);

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let path = self.to_fs_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&tmp_path, &value).await?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("Stored {} bytes under {}", value.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.to_fs_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.put("offline_queue", b"[]".to_vec()).await.unwrap();
        assert_eq!(store.get("offline_queue").await.unwrap(), Some(b"[]".to_vec()));
    }

    #[tokio::test]
    async fn test_nested_keys_and_listing() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.put("read_model/finance", b"{}".to_vec()).await.unwrap();
        store.put("read_model/health", b"{}".to_vec()).await.unwrap();
        store.put("offline_queue", b"[]".to_vec()).await.unwrap();

        let keys = store.keys().await.unwrap();
        assert_eq!(
            keys,
            vec![
                "offline_queue".to_string(),
                "read_model/finance".to_string(),
                "read_model/health".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = FileStore::new(temp.path()).unwrap();
            store.put("read_model/dashboard", b"{\"steps\":10}".to_vec()).await.unwrap();
        }

        let reopened = FileStore::new(temp.path()).unwrap();
        assert_eq!(
            reopened.get("read_model/dashboard").await.unwrap(),
            Some(b"{\"steps\":10}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.put("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        assert!(store.put("../outside", vec![1]).await.is_err());
    }
}
