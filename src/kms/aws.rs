//! AWS KMS backend.
//!
//! KEKs are addressed through the alias `alias/<key id>`. The key behind an
//! alias is created once; later `create_kek` calls only import material.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{Result, ResultExt};
use crate::kms::keyservice::{KeyOrigin, KeyRef, KeyServiceApi, KeySpec};
use crate::kms::kms_tags;
use crate::kms::wrapped::KekBackend;

/// Encryption context key binding a wrapped DEK to its name.
pub const DEK_CONTEXT: &str = "aws:ebs:id";

pub fn alias(key_id: &str) -> String {
    format!("alias/{key_id}")
}

fn encryption_context(dek_name: &str) -> Vec<u8> {
    format!("{DEK_CONTEXT}={dek_name}").into_bytes()
}

pub struct AwsKms {
    client: Arc<dyn KeyServiceApi>,
    key_policy: String,
}

impl AwsKms {
    pub fn new(client: Arc<dyn KeyServiceApi>, key_policy: impl Into<String>) -> Self {
        Self {
            client,
            key_policy: key_policy.into(),
        }
    }

    async fn clean_up(&self, alias: &str) {
        if let Err(err) = self.client.schedule_deletion(alias).await {
            warn!(alias, error = %err, "failed to schedule deletion of new KEK");
        }
    }
}

#[async_trait]
impl KekBackend for AwsKms {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        let alias = alias(key_id);
        let spec = KeySpec {
            origin: if material.is_empty() {
                KeyOrigin::Service
            } else {
                KeyOrigin::External
            },
            hardware_protected: false,
            policy: Some(self.key_policy.clone()),
            tags: kms_tags(),
        };

        let exists = self
            .client
            .key_version(&alias)
            .await
            .context("describing KEK")?
            .is_some();
        if !exists {
            info!(alias = %alias, "creating KEK");
            self.client
                .create_key(&alias, &spec)
                .await
                .context("creating KEK")?;
        }

        if !material.is_empty() {
            if let Err(err) = self.client.import_key(&alias, material, &spec).await {
                if !exists {
                    self.clean_up(&alias).await;
                }
                return Err(err.context("importing KEK material"));
            }
        }
        Ok(())
    }

    async fn wrap_dek(&self, kek_id: &str, dek_name: &str, dek: &[u8]) -> Result<Vec<u8>> {
        let alias = alias(kek_id);
        self.client
            .wrap(KeyRef::latest(&alias), dek, &encryption_context(dek_name))
            .await
    }

    async fn unwrap_dek(&self, kek_id: &str, dek_name: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
        let alias = alias(kek_id);
        self.client
            .unwrap(KeyRef::latest(&alias), wrapped, &encryption_context(dek_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::keyservice::InMemoryKeyService;

    #[tokio::test]
    async fn test_create_kek_uses_alias_and_policy() {
        let service = Arc::new(InMemoryKeyService::new());
        let kms = AwsKms::new(service.clone(), "{\"Version\":\"2012-10-17\"}");
        kms.create_kek("cluster-kek", &[]).await.unwrap();

        let spec = service.spec_of("alias/cluster-kek").await.unwrap();
        assert_eq!(spec.origin, KeyOrigin::Service);
        assert_eq!(spec.policy.as_deref(), Some("{\"Version\":\"2012-10-17\"}"));
        assert_eq!(spec.tags.get("created-by").map(String::as_str), Some("bootstrapper"));

        // A second call finds the alias and creates nothing.
        kms.create_kek("cluster-kek", &[]).await.unwrap();
        assert_eq!(service.key_version("alias/cluster-kek").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_failed_import_cleans_up_new_key() {
        let service = Arc::new(InMemoryKeyService::new());
        let kms = AwsKms::new(service.clone(), "policy");

        // The in-memory service only accepts 32 byte material.
        assert!(kms.create_kek("cluster-kek", b"short").await.is_err());
        assert!(service.is_pending_deletion("alias/cluster-kek").await);
    }

    #[tokio::test]
    async fn test_wrap_is_bound_to_dek_name() {
        let service = Arc::new(InMemoryKeyService::new());
        let kms = AwsKms::new(service, "policy");
        kms.create_kek("cluster-kek", &[3u8; 32]).await.unwrap();

        let wrapped = kms.wrap_dek("cluster-kek", "disk-a", b"dek").await.unwrap();
        assert_eq!(kms.unwrap_dek("cluster-kek", "disk-a", &wrapped).await.unwrap(), b"dek");
        assert!(kms.unwrap_dek("cluster-kek", "disk-b", &wrapped).await.is_err());
    }
}
