//! Azure Key Vault and managed HSM backends.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::config::SYMMETRIC_KEY_LENGTH;
use crate::error::{Error, Result, ResultExt};
use crate::kms::keyservice::{KeyOrigin, KeyRef, KeyServiceApi, KeySpec};
use crate::kms::kms_tags;
use crate::kms::uri::VaultType;
use crate::kms::wrapped::KekBackend;

/// Host suffix of managed HSM vaults.
pub const HSM_SUFFIX: &str = ".managedhsm.azure.net/";

const VAULT_PREFIX: &str = "https://";

pub fn vault_url(name: &str, vault_type: VaultType) -> String {
    format!("{VAULT_PREFIX}{name}{}", vault_type.suffix())
}

pub fn hsm_url(name: &str) -> String {
    format!("{VAULT_PREFIX}{name}{HSM_SUFFIX}")
}

/// The version segment of a key ID URL `https://<vault>/keys/<name>/<version>`.
pub fn parse_key_version(key_id: &str) -> Result<String> {
    let parsed = Url::parse(key_id).map_err(|e| Error::Backend(format!("invalid key ID URL {key_id}: {e}")))?;
    let path = parsed.path().strip_prefix("/keys/").unwrap_or_default();
    match path.split('/').collect::<Vec<_>>().as_slice() {
        [name, version] if !name.is_empty() && !version.is_empty() => Ok((*version).to_string()),
        _ => Err(Error::Backend(format!("invalid key ID URL: {key_id}"))),
    }
}

fn key_spec(material: &[u8], hardware_protected: bool) -> KeySpec {
    KeySpec {
        origin: if material.is_empty() {
            KeyOrigin::Service
        } else {
            KeyOrigin::External
        },
        hardware_protected,
        policy: None,
        tags: kms_tags(),
    }
}

async fn create_or_import(client: &dyn KeyServiceApi, key_id: &str, material: &[u8], hsm: bool) -> Result<()> {
    let spec = key_spec(material, hsm);
    if material.is_empty() {
        client.create_key(key_id, &spec).await.context("creating new KEK")?;
    } else {
        if material.len() != SYMMETRIC_KEY_LENGTH {
            return Err(Error::InvalidKey.context("importing KEK"));
        }
        client
            .import_key(key_id, material, &spec)
            .await
            .context("importing KEK")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Key Vault
// ---------------------------------------------------------------------------

/// Software-protected keys in an Azure Key Vault. Wraps with the latest key
/// version.
pub struct AzureKms {
    client: Arc<dyn KeyServiceApi>,
    vault_url: String,
}

impl AzureKms {
    pub fn new(client: Arc<dyn KeyServiceApi>, vault_name: &str, vault_type: VaultType) -> Self {
        Self {
            client,
            vault_url: vault_url(vault_name, vault_type),
        }
    }

    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }
}

#[async_trait]
impl KekBackend for AzureKms {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        create_or_import(self.client.as_ref(), key_id, material, false).await
    }

    async fn wrap_dek(&self, kek_id: &str, _dek_name: &str, dek: &[u8]) -> Result<Vec<u8>> {
        self.client.wrap(KeyRef::latest(kek_id), dek, &[]).await
    }

    async fn unwrap_dek(&self, kek_id: &str, _dek_name: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.client.unwrap(KeyRef::latest(kek_id), wrapped, &[]).await
    }
}

// ---------------------------------------------------------------------------
// Managed HSM
// ---------------------------------------------------------------------------

/// Hardware-protected keys in an Azure managed HSM. Every wrap and unwrap
/// first resolves the KEK's current version and pins it.
pub struct AzureHsm {
    client: Arc<dyn KeyServiceApi>,
    vault_url: String,
}

impl AzureHsm {
    pub fn new(client: Arc<dyn KeyServiceApi>, vault_name: &str) -> Self {
        Self {
            client,
            vault_url: hsm_url(vault_name),
        }
    }

    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }

    /// Azure clients report versions as full key IDs; bare versions pass
    /// through unchanged.
    async fn current_version(&self, kek_id: &str) -> Result<String> {
        let version = self
            .client
            .key_version(kek_id)
            .await
            .context("unable to detect key version")?
            .ok_or_else(|| Error::KekUnset.context(format!("KEK {kek_id}")))?;
        if version.starts_with(VAULT_PREFIX) {
            parse_key_version(&version)
        } else {
            Ok(version)
        }
    }
}

#[async_trait]
impl KekBackend for AzureHsm {
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()> {
        create_or_import(self.client.as_ref(), key_id, material, true).await
    }

    async fn wrap_dek(&self, kek_id: &str, _dek_name: &str, dek: &[u8]) -> Result<Vec<u8>> {
        let version = self.current_version(kek_id).await?;
        self.client
            .wrap(KeyRef { name: kek_id, version: Some(version.as_str()) }, dek, &[])
            .await
            .context("wrapping key")
    }

    async fn unwrap_dek(&self, kek_id: &str, _dek_name: &str, wrapped: &[u8]) -> Result<Vec<u8>> {
        let version = self.current_version(kek_id).await?;
        self.client
            .unwrap(KeyRef { name: kek_id, version: Some(version.as_str()) }, wrapped, &[])
            .await
            .context("unwrapping key")
    }
}
