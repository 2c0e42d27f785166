//! DEK engine shared by the cloud KMS backends.
//!
//! ```text
//! get_dek(name) -> storage.get(name) -> unwrap under KEK            (known)
//!                                    -> DekUnset: random -> wrap -> put (new)
//! ```
//!
//! A lock per DEK name serializes first creation inside one process, so two
//! concurrent callers asking for a new name agree on a single DEK. The lock
//! is dropped from the table once its last caller is done.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::crypto;
use crate::error::{Error, Result, ResultExt};
use crate::kms::{CloudKms, Storage};

/// The KEK operations a cloud backend provides.
#[async_trait]
pub trait KekBackend: Send + Sync {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()>;
    /// Wrap `dek` under the KEK. `dek_name` is bound to the ciphertext where
    /// the backend supports it.
    async fn wrap_dek(&self, kek_id: &str, dek_name: &str, dek: &[u8]) -> Result<Vec<u8>>;
    async fn unwrap_dek(&self, kek_id: &str, dek_name: &str, wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// A [`CloudKms`] that stores DEKs wrapped by a [`KekBackend`].
pub struct StoredDekKms<B> {
    backend: B,
    storage: Arc<dyn Storage>,
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<B: KekBackend> StoredDekKms<B> {
    pub fn new(backend: B, storage: Arc<dyn Storage>) -> Self {
        Self {
            backend,
            storage,
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn name_lock(&self, dek_name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .lock()
            .await
            .entry(dek_name.to_string())
            .or_default()
            .clone()
    }

    async fn release_name_lock(&self, dek_name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.name_locks.lock().await;
        // One reference is the table's, the other is ours. Waiters clone
        // theirs under the table lock, so nobody can show up in between.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(dek_name);
        }
    }

    async fn load_or_create(&self, kek_id: &str, dek_name: &str, size: usize) -> Result<Vec<u8>> {
        match self.storage.get(dek_name).await {
            Ok(wrapped) => {
                let dek = self
                    .backend
                    .unwrap_dek(kek_id, dek_name, &wrapped)
                    .await
                    .with_context(|| format!("unwrapping DEK {dek_name}"))?;
                if dek.len() != size {
                    return Err(Error::Invalid(format!(
                        "stored DEK {dek_name} has {} bytes, expected {size}",
                        dek.len()
                    )));
                }
                Ok(dek)
            }
            Err(err) if err.is_dek_unset() => {
                debug!(dek_name, "creating new DEK");
                let dek = crypto::generate_random_bytes(size)?;
                let wrapped = self
                    .backend
                    .wrap_dek(kek_id, dek_name, &dek)
                    .await
                    .with_context(|| format!("wrapping DEK {dek_name}"))?;
                self.storage
                    .put(dek_name, &wrapped)
                    .await
                    .with_context(|| format!("storing DEK {dek_name}"))?;
                Ok(dek)
            }
            Err(err) => Err(err.context("loading encrypted DEK from storage")),
        }
    }
}

#[async_trait]
impl<B: KekBackend> CloudKms for StoredDekKms<B> {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        self.backend.create_kek(key_id, material).await
    }

    async fn get_dek(&self, kek_id: &str, dek_name: &str, size: usize) -> Result<Vec<u8>> {
        let lock = self.name_lock(dek_name).await;
        let dek = {
            let _guard = lock.lock().await;
            self.load_or_create(kek_id, dek_name, size).await
        };
        self.release_name_lock(dek_name, lock).await;
        dek
    }
}
