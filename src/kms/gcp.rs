//! Google Cloud KMS backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, ResultExt};
use crate::kms::keyservice::{KeyOrigin, KeyRef, KeyServiceApi, KeySpec};
use crate::kms::kms_tags;
use crate::kms::uri::ProtectionLevel;
use crate::kms::wrapped::KekBackend;

pub struct GcpKms {
    client: Arc<dyn KeyServiceApi>,
    project: String,
    location: String,
    key_ring: String,
    protection_level: ProtectionLevel,
}

impl GcpKms {
    pub fn new(
        client: Arc<dyn KeyServiceApi>,
        project: impl Into<String>,
        location: impl Into<String>,
        key_ring: impl Into<String>,
        protection_level: ProtectionLevel,
    ) -> Self {
        Self {
            client,
            project: project.into(),
            location: location.into(),
            key_ring: key_ring.into(),
            protection_level,
        }
    }

    /// Full resource name of `key_id`.
    pub fn key_path(&self, key_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            self.project, self.location, self.key_ring, key_id
        )
    }
}

#[async_trait]
impl KekBackend for GcpKms {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        let path = self.key_path(key_id);
        let spec = KeySpec {
            origin: if material.is_empty() {
                KeyOrigin::Service
            } else {
                KeyOrigin::External
            },
            hardware_protected: self.protection_level == ProtectionLevel::Hsm,
            policy: None,
            tags: kms_tags(),
        };
        if material.is_empty() {
            self.client.create_key(&path, &spec).await.context("creating KEK")?;
        } else {
            self.client
                .import_key(&path, material, &spec)
                .await
                .context("importing KEK")?;
        }
        Ok(())
    }

    async fn wrap_dek(&self, kek_id: &str, _dek_name: &str, dek: &[u8]) -> Result<Vec<u8>> {
        let path = self.key_path(kek_id);
        self.client.wrap(KeyRef::latest(&path), dek, &[]).await
    }

    async fn unwrap_dek(&self, kek_id: &str, _dek_name: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
        let path = self.key_path(kek_id);
        self.client.unwrap(KeyRef::latest(&path), wrapped, &[]).await
    }
}
