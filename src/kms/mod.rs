//! Key management.
//!
//! A [`CloudKms`] owns a key encryption key (KEK) and hands out data
//! encryption keys (DEKs) by name. DEKs are persisted only in wrapped form in
//! a [`Storage`] backend. Which KMS and which storage are used is decided at
//! startup from two URIs, see [`set_up_kms`].
//!
//! ```text
//! kms://cluster-kms            storage://no-store
//! kms://aws-kms?keyPolicy=     storage://aws-s3?bucket=
//! kms://azure-kms?name=&type=  storage://azure-blob?container=&connection_string=
//! kms://azure-hsm?name=        storage://gcp-storage?project=&bucket=
//! kms://gcp-kms?project=&location=&keyRing=&protectionLvl=
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

pub mod aws;
pub mod azure;
pub mod cluster;
pub mod gcp;
pub mod keyservice;
pub mod setup;
pub mod storage;
pub mod uri;
pub mod wrapped;

pub use setup::{set_up_kms, set_up_kms_with, BackendConnector, Disconnected};
pub use storage::MemMapStorage;

/// Tags attached to every key this crate creates in a cloud KMS.
pub fn kms_tags() -> BTreeMap<String, String> {
    BTreeMap::from([("created-by".to_string(), "bootstrapper".to_string())])
}

/// A key management service holding a KEK.
#[async_trait]
pub trait CloudKms: Send + Sync {
    /// Create the KEK `key_id`. Empty `material` asks the backend to generate
    /// the key; otherwise the material is imported.
    async fn create_kek(&self, key_id: &str, material: &[u8]) -> Result<()>;

    /// The plaintext DEK stored under `dek_name`, creating it on first use.
    ///
    /// Repeated calls with the same name return the same bytes; the result is
    /// always `size` bytes long.
    async fn get_dek(&self, kek_id: &str, dek_name: &str, size: usize) -> Result<Vec<u8>>;
}

/// Persists wrapped DEKs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The wrapped DEK stored under `name`, or [`Error::DekUnset`].
    ///
    /// [`Error::DekUnset`]: crate::error::Error::DekUnset
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    async fn put(&self, name: &str, data: &[u8]) -> Result<()>;
}
