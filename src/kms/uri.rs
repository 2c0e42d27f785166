//! KMS and storage URI parsing.
//!
//! Parsing is strict: a URI must use the expected scheme, name a known
//! backend, and carry exactly the query parameters that backend needs, each
//! with a non-empty value. Nothing falls back to a default.

use std::str::FromStr;

use url::Url;

use crate::error::{Error, Result};

pub const KMS_SCHEME: &str = "kms";
pub const STORAGE_SCHEME: &str = "storage";

pub const CLUSTER_KMS: &str = "cluster-kms";
pub const AWS_KMS: &str = "aws-kms";
pub const AZURE_KMS: &str = "azure-kms";
pub const AZURE_HSM: &str = "azure-hsm";
pub const GCP_KMS: &str = "gcp-kms";

pub const NO_STORE: &str = "no-store";
pub const AWS_S3: &str = "aws-s3";
pub const AZURE_BLOB: &str = "azure-blob";
pub const GCP_STORAGE: &str = "gcp-storage";

/// Where wrapped DEKs are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    NoStore,
    AwsS3 { bucket: String },
    AzureBlob { container: String, connection_string: String },
    GcpStorage { project: String, bucket: String },
}

/// Which service holds the KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsUri {
    ClusterKms,
    AwsKms { key_policy: String },
    AzureKms { vault_name: String, vault_type: VaultType },
    AzureHsm { vault_name: String },
    GcpKms { project: String, location: String, key_ring: String, protection_level: ProtectionLevel },
}

/// Azure cloud a key vault lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultType {
    Default,
    China,
    UsGov,
    German,
}

impl VaultType {
    /// Host suffix of vaults in this cloud.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Default => ".vault.azure.net/",
            Self::China => ".vault.azure.cn/",
            Self::UsGov => ".vault.usgovcloudapi.net/",
            Self::German => ".vault.microsoftazure.de/",
        }
    }
}

impl FromStr for VaultType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "china" => Ok(Self::China),
            "usgov" => Ok(Self::UsGov),
            "german" => Ok(Self::German),
            other => Err(Error::InvalidUri(format!("unknown Azure vault type {other:?}"))),
        }
    }
}

/// GCP key protection level, as its numeric API value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionLevel {
    Software = 1,
    Hsm = 2,
}

impl FromStr for ProtectionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let level: i32 = s
            .parse()
            .map_err(|_| Error::InvalidUri(format!("protection level {s:?} is not an integer")))?;
        match level {
            1 => Ok(Self::Software),
            2 => Ok(Self::Hsm),
            other => Err(Error::InvalidUri(format!("unsupported protection level {other}"))),
        }
    }
}

/// Parse `uri`, check its scheme, and return it with its backend name.
fn parse(uri: &str, scheme: &str) -> Result<(Url, String)> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{uri:?}: {e}")))?;
    if url.scheme() != scheme {
        return Err(Error::InvalidUri(format!(
            "expected scheme {scheme:?}, got {:?}",
            url.scheme()
        )));
    }
    if !matches!(url.path(), "" | "/") {
        return Err(Error::InvalidUri(format!("unexpected path {:?}", url.path())));
    }
    let backend = url.host_str().unwrap_or_default().to_string();
    Ok((url, backend))
}

/// Extract the values of `keys` from `query`, in order.
///
/// Fails if a key is missing, has an empty value or appears twice. Parameters
/// not named in `keys` are ignored here; backend parsers reject them through
/// [`get_exact_config`].
pub fn get_config(query: &[(String, String)], keys: &[&str]) -> Result<Vec<String>> {
    keys.iter()
        .map(|key| {
            let mut values = query.iter().filter(|(k, _)| k == key).map(|(_, v)| v);
            match (values.next(), values.next()) {
                (Some(v), None) if !v.is_empty() => Ok(v.clone()),
                (Some(_), Some(_)) => Err(Error::InvalidUri(format!("parameter {key:?} given twice"))),
                _ => Err(Error::MissingParameter((*key).to_string())),
            }
        })
        .collect()
}

/// Like [`get_config`], but the query must not carry anything beyond `keys`.
pub fn get_exact_config(query: &[(String, String)], keys: &[&str]) -> Result<Vec<String>> {
    if let Some((extra, _)) = query.iter().find(|(k, _)| !keys.contains(&k.as_str())) {
        return Err(Error::InvalidUri(format!("unexpected parameter {extra:?}")));
    }
    get_config(query, keys)
}

fn query_of(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

impl FromStr for StorageUri {
    type Err = Error;

    fn from_str(uri: &str) -> Result<Self> {
        let (url, backend) = parse(uri, STORAGE_SCHEME)?;
        let query = query_of(&url);
        match backend.as_str() {
            NO_STORE => {
                get_exact_config(&query, &[])?;
                Ok(Self::NoStore)
            }
            AWS_S3 => {
                let mut v = get_exact_config(&query, &["bucket"])?.into_iter();
                Ok(Self::AwsS3 { bucket: next(&mut v) })
            }
            AZURE_BLOB => {
                let mut v = get_exact_config(&query, &["container", "connection_string"])?.into_iter();
                Ok(Self::AzureBlob {
                    container: next(&mut v),
                    connection_string: next(&mut v),
                })
            }
            GCP_STORAGE => {
                let mut v = get_exact_config(&query, &["project", "bucket"])?.into_iter();
                Ok(Self::GcpStorage {
                    project: next(&mut v),
                    bucket: next(&mut v),
                })
            }
            other => Err(Error::UnknownBackend {
                kind: "storage",
                backend: other.to_string(),
            }),
        }
    }
}

impl FromStr for KmsUri {
    type Err = Error;

    fn from_str(uri: &str) -> Result<Self> {
        let (url, backend) = parse(uri, KMS_SCHEME)?;
        let query = query_of(&url);
        match backend.as_str() {
            CLUSTER_KMS => {
                get_exact_config(&query, &[])?;
                Ok(Self::ClusterKms)
            }
            AWS_KMS => {
                let mut v = get_exact_config(&query, &["keyPolicy"])?.into_iter();
                Ok(Self::AwsKms { key_policy: next(&mut v) })
            }
            AZURE_KMS => {
                let mut v = get_exact_config(&query, &["name", "type"])?.into_iter();
                let vault_name = next(&mut v);
                let vault_type = next(&mut v).parse()?;
                Ok(Self::AzureKms { vault_name, vault_type })
            }
            AZURE_HSM => {
                let mut v = get_exact_config(&query, &["name"])?.into_iter();
                Ok(Self::AzureHsm { vault_name: next(&mut v) })
            }
            GCP_KMS => {
                let mut v = get_exact_config(&query, &["project", "location", "keyRing", "protectionLvl"])?
                    .into_iter();
                Ok(Self::GcpKms {
                    project: next(&mut v),
                    location: next(&mut v),
                    key_ring: next(&mut v),
                    protection_level: next(&mut v).parse()?,
                })
            }
            other => Err(Error::UnknownBackend {
                kind: "kms",
                backend: other.to_string(),
            }),
        }
    }
}

// get_exact_config returns exactly one value per key, so the iterator never runs dry.
fn next(values: &mut impl Iterator<Item = String>) -> String {
    values.next().unwrap_or_default()
}
