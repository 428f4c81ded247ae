//! Key-value store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use lifetrack_common::{Error, Result};

/// Durable key-value storage.
///
/// Keys are short `/`-free or `/`-separated identifiers chosen by the
/// caller (e.g. `offline_queue`, `read_model/finance`). Values are opaque
/// bytes; most callers go through [`load_json`] and [`save_json`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - A subsequent `get` (also after a restart, for durable stores)
    ///   returns exactly `value`
    /// - A failed write leaves the previous value intact
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove the value under `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all stored keys.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Load and decode a JSON value stored under `key`.
pub async fn load_json<T, S>(store: &S, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Serialization(format!("Corrupt value for {}: {}", key, e))),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`.
pub async fn save_json<T, S>(store: &S, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}

/// Reject keys that cannot be mapped onto a storage location.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(Error::InvalidInput(format!("Invalid store key: {}", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("offline_queue").is_ok());
        assert!(validate_key("read_model/finance").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("a//b").is_err());
    }
}
