//! KMS that lives inside the cluster.
//!
//! DEKs are never stored: each one is derived from the master key with the
//! DEK name as HKDF info, so the same name yields the same key on every node
//! and across restarts.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::RNG_LENGTH_DEFAULT;
use crate::crypto;
use crate::error::{Error, Result};
use crate::keys::{derive_key, MasterSecret, KDF_SALT};
use crate::kms::CloudKms;

#[derive(Debug, Default)]
pub struct ClusterKms {
    master_key: RwLock<Option<MasterSecret>>,
}

impl ClusterKms {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CloudKms for ClusterKms {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        let key = if material.is_empty() {
            crypto::generate_random_bytes(RNG_LENGTH_DEFAULT)?
        } else {
            material.to_vec()
        };
        debug!(key_id, "setting cluster KMS master key");
        *self.master_key.write().await = Some(MasterSecret::new(key));
        Ok(())
    }

    async fn get_dek(&self, _kek_id: &str, dek_name: &str, size: usize) -> Result<Vec<u8>> {
        let guard = self.master_key.read().await;
        let master = guard.as_ref().ok_or(Error::KekUnset)?;
        let dek = derive_key(master.as_bytes(), KDF_SALT, dek_name.as_bytes(), size)?;
        Ok(dek.to_vec())
    }
}
