//! Backends for wrapped DEKs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::kms::Storage;

/// In-process storage. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemMapStorage {
    dek: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemMapStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemMapStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.dek.read().await.get(name).cloned().ok_or(Error::DekUnset)
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.dek.write().await.insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cloud object stores
// ---------------------------------------------------------------------------

/// Client capability for one bucket (S3, GCS) or container (Azure Blob).
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Create the bucket or container unless it already exists.
    async fn ensure_container(&self) -> Result<()>;
    /// The object stored under `key`, `None` if there is none.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;
}

/// [`Storage`] on top of a cloud object store.
pub struct BucketStorage {
    client: Arc<dyn ObjectStoreApi>,
    kind: &'static str,
}

impl BucketStorage {
    /// Wrap `client`, creating its bucket or container on first use.
    pub async fn new(client: Arc<dyn ObjectStoreApi>, kind: &'static str) -> Result<Self> {
        client
            .ensure_container()
            .await
            .with_context(|| format!("preparing {kind} storage"))?;
        Ok(Self { client, kind })
    }
}

#[async_trait]
impl Storage for BucketStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        match self.client.get_object(name).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Error::DekUnset),
            Err(err) => Err(err.context(format!("reading {name} from {} storage", self.kind))),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        debug!(storage = self.kind, name, "storing wrapped DEK");
        self.client
            .put_object(name, data)
            .await
            .with_context(|| format!("writing {name} to {} storage", self.kind))
    }
}

/// Object store kept in memory, for development clusters and tests.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    containers_created: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn containers_created(&self) -> usize {
        self.containers_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStoreApi for InMemoryObjectStore {
    async fn ensure_container(&self) -> Result<()> {
        self.containers_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memmap_storage() {
        let store = MemMapStorage::new();
        assert!(store.get("test:input").await.unwrap_err().is_dek_unset());

        store.put("test:input", b"Test Data").await.unwrap();
        assert_eq!(store.get("test:input").await.unwrap(), b"Test Data");

        store.put("test:input", b"Replaced").await.unwrap();
        assert_eq!(store.get("test:input").await.unwrap(), b"Replaced");
    }

    #[tokio::test]
    async fn test_bucket_storage_creates_container_and_maps_missing() {
        let client = Arc::new(InMemoryObjectStore::new());
        let store = BucketStorage::new(client.clone(), "aws-s3").await.unwrap();
        assert_eq!(client.containers_created(), 1);

        assert!(store.get("disk-1").await.unwrap_err().is_dek_unset());
        store.put("disk-1", b"wrapped").await.unwrap();
        assert_eq!(store.get("disk-1").await.unwrap(), b"wrapped");
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStoreApi for BrokenStore {
        async fn ensure_container(&self) -> Result<()> {
            Ok(())
        }
        async fn get_object(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(Error::Backend("access denied".into()))
        }
        async fn put_object(&self, _key: &str, _data: &[u8]) -> Result<()> {
            Err(Error::Backend("access denied".into()))
        }
    }

    #[tokio::test]
    async fn test_bucket_storage_keeps_backend_errors() {
        let store = BucketStorage::new(Arc::new(BrokenStore), "gcp-storage").await.unwrap();
        let err = store.get("disk-1").await.unwrap_err();
        assert!(!err.is_dek_unset());
        assert!(err.to_string().contains("access denied"));
    }
}
