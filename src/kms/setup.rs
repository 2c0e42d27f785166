//! Resolve storage and KMS URIs into a ready [`CloudKms`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result, ResultExt};
use crate::kms::aws::AwsKms;
use crate::kms::azure::{hsm_url, vault_url, AzureHsm, AzureKms};
use crate::kms::cluster::ClusterKms;
use crate::kms::gcp::GcpKms;
use crate::kms::keyservice::{InMemoryKeyService, KeyServiceApi};
use crate::kms::storage::{BucketStorage, InMemoryObjectStore, MemMapStorage, ObjectStoreApi};
use crate::kms::uri::{self, KmsUri, StorageUri};
use crate::kms::wrapped::StoredDekKms;
use crate::kms::{CloudKms, Storage};

/// The remote key service a KMS URI points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyServiceTarget {
    AwsKms,
    AzureKeyVault { vault_url: String },
    AzureManagedHsm { vault_url: String },
    GcpKms { project: String, location: String, key_ring: String },
}

impl KeyServiceTarget {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::AwsKms => uri::AWS_KMS,
            Self::AzureKeyVault { .. } => uri::AZURE_KMS,
            Self::AzureManagedHsm { .. } => uri::AZURE_HSM,
            Self::GcpKms { .. } => uri::GCP_KMS,
        }
    }
}

/// The bucket or container a storage URI points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreTarget {
    AwsS3 { bucket: String },
    AzureBlob { container: String, connection_string: String },
    GcpStorage { project: String, bucket: String },
}

impl ObjectStoreTarget {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::AwsS3 { .. } => uri::AWS_S3,
            Self::AzureBlob { .. } => uri::AZURE_BLOB,
            Self::GcpStorage { .. } => uri::GCP_STORAGE,
        }
    }
}

/// Supplies cloud clients for the backends a URI selects.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn key_service(&self, target: &KeyServiceTarget) -> Result<Arc<dyn KeyServiceApi>>;
    async fn object_store(&self, target: &ObjectStoreTarget) -> Result<Arc<dyn ObjectStoreApi>>;
}

/// Connector without any cloud clients. Only `no-store` and `cluster-kms`
/// resolve through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disconnected;

#[async_trait]
impl BackendConnector for Disconnected {
    async fn key_service(&self, target: &KeyServiceTarget) -> Result<Arc<dyn KeyServiceApi>> {
        Err(Error::NotConnected(target.backend().to_string()))
    }

    async fn object_store(&self, target: &ObjectStoreTarget) -> Result<Arc<dyn ObjectStoreApi>> {
        Err(Error::NotConnected(target.backend().to_string()))
    }
}

/// Connector serving every backend from process memory, for development
/// clusters and tests. All targets share one key service and one object store.
#[derive(Default)]
pub struct InMemoryConnector {
    pub keys: Arc<InMemoryKeyService>,
    pub objects: Arc<InMemoryObjectStore>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendConnector for InMemoryConnector {
    async fn key_service(&self, _target: &KeyServiceTarget) -> Result<Arc<dyn KeyServiceApi>> {
        Ok(self.keys.clone())
    }

    async fn object_store(&self, _target: &ObjectStoreTarget) -> Result<Arc<dyn ObjectStoreApi>> {
        Ok(self.objects.clone())
    }
}

/// Build a KMS from `storage_uri` and `kms_uri` using only the self-contained
/// backends.
pub async fn set_up_kms(storage_uri: &str, kms_uri: &str) -> Result<Box<dyn CloudKms>> {
    set_up_kms_with(&Disconnected, storage_uri, kms_uri).await
}

/// Build a KMS from `storage_uri` and `kms_uri`, taking cloud clients from
/// `connector`. Both URIs are validated before any client is requested.
pub async fn set_up_kms_with(
    connector: &dyn BackendConnector,
    storage_uri: &str,
    kms_uri: &str,
) -> Result<Box<dyn CloudKms>> {
    let storage_uri: StorageUri = storage_uri.parse().context("parsing storage URI")?;
    let kms_uri: KmsUri = kms_uri.parse().context("parsing KMS URI")?;

    let storage = get_store(connector, &storage_uri).await?;
    get_kms(connector, &kms_uri, storage).await
}

/// The storage backend `uri` names.
pub async fn get_store(connector: &dyn BackendConnector, uri: &StorageUri) -> Result<Arc<dyn Storage>> {
    let target = match uri {
        StorageUri::NoStore => return Ok(Arc::new(MemMapStorage::new())),
        StorageUri::AwsS3 { bucket } => ObjectStoreTarget::AwsS3 { bucket: bucket.clone() },
        StorageUri::AzureBlob {
            container,
            connection_string,
        } => ObjectStoreTarget::AzureBlob {
            container: container.clone(),
            connection_string: connection_string.clone(),
        },
        StorageUri::GcpStorage { project, bucket } => ObjectStoreTarget::GcpStorage {
            project: project.clone(),
            bucket: bucket.clone(),
        },
    };

    let backend = target.backend();
    let client = connector
        .object_store(&target)
        .await
        .with_context(|| format!("connecting to {backend}"))?;
    info!(backend, "using object storage for DEKs");
    Ok(Arc::new(BucketStorage::new(client, backend).await?))
}

/// The KMS `uri` names, storing its DEKs in `storage`.
pub async fn get_kms(
    connector: &dyn BackendConnector,
    uri: &KmsUri,
    storage: Arc<dyn Storage>,
) -> Result<Box<dyn CloudKms>> {
    let kms: Box<dyn CloudKms> = match uri {
        KmsUri::ClusterKms => Box::new(ClusterKms::new()),
        KmsUri::AwsKms { key_policy } => {
            let client = key_service(connector, &KeyServiceTarget::AwsKms).await?;
            Box::new(StoredDekKms::new(AwsKms::new(client, key_policy.clone()), storage))
        }
        KmsUri::AzureKms {
            vault_name,
            vault_type,
        } => {
            let target = KeyServiceTarget::AzureKeyVault {
                vault_url: vault_url(vault_name, *vault_type),
            };
            let client = key_service(connector, &target).await?;
            Box::new(StoredDekKms::new(
                AzureKms::new(client, vault_name, *vault_type),
                storage,
            ))
        }
        KmsUri::AzureHsm { vault_name } => {
            let target = KeyServiceTarget::AzureManagedHsm {
                vault_url: hsm_url(vault_name),
            };
            let client = key_service(connector, &target).await?;
            Box::new(StoredDekKms::new(AzureHsm::new(client, vault_name), storage))
        }
        KmsUri::GcpKms {
            project,
            location,
            key_ring,
            protection_level,
        } => {
            let target = KeyServiceTarget::GcpKms {
                project: project.clone(),
                location: location.clone(),
                key_ring: key_ring.clone(),
            };
            let client = key_service(connector, &target).await?;
            Box::new(StoredDekKms::new(
                GcpKms::new(client, project.clone(), location.clone(), key_ring.clone(), *protection_level),
                storage,
            ))
        }
    };
    Ok(kms)
}

async fn key_service(
    connector: &dyn BackendConnector,
    target: &KeyServiceTarget,
) -> Result<Arc<dyn KeyServiceApi>> {
    let backend = target.backend();
    let client = connector
        .key_service(target)
        .await
        .with_context(|| format!("connecting to {backend}"))?;
    info!(backend, "using cloud KMS for KEK");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_self_contained_backends() {
        let kms = set_up_kms("storage://no-store", "kms://cluster-kms").await.unwrap();
        kms.create_kek("kek", b"master").await.unwrap();
        assert_eq!(kms.get_dek("kek", "disk-1", 32).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_unknown_or_mismatched_uris() {
        for (storage, kms) in [
            ("storage://unknown", "kms://cluster-kms"),
            ("storage://no-store", "kms://unknown"),
            ("kms://cluster-kms", "kms://cluster-kms"),
            ("storage://no-store", "storage://no-store"),
            (":/123", "kms://cluster-kms"),
            ("storage://no-store", ":/123"),
        ] {
            assert!(set_up_kms(storage, kms).await.is_err(), "{storage} {kms}");
        }
    }

    #[tokio::test]
    async fn test_cloud_backends_need_a_connector() {
        let err = set_up_kms("storage://aws-s3?bucket=deks", "kms://cluster-kms")
            .await
            .err()
            .unwrap();
        assert!(matches!(err.root(), Error::NotConnected(b) if b == "aws-s3"));

        let err = set_up_kms("storage://no-store", "kms://azure-hsm?name=vault")
            .await
            .err()
            .unwrap();
        assert!(matches!(err.root(), Error::NotConnected(b) if b == "azure-hsm"));
    }

    #[tokio::test]
    async fn test_in_memory_connector_round_trip() {
        let connector = InMemoryConnector::new();
        let kms = set_up_kms_with(
            &connector,
            "storage://gcp-storage?project=p&bucket=deks",
            "kms://gcp-kms?project=p&location=global&keyRing=ring&protectionLvl=1",
        )
        .await
        .unwrap();
        assert_eq!(connector.objects.containers_created(), 1);

        kms.create_kek("kek", &[]).await.unwrap();
        let dek = kms.get_dek("kek", "disk-1", 32).await.unwrap();
        assert_eq!(kms.get_dek("kek", "disk-1", 32).await.unwrap(), dek);
        assert!(connector.objects.get_object("disk-1").await.unwrap().is_some());
    }
}
