//! Init server.
//!
//! Serves exactly one successful `init` on the first control-plane node. The
//! operator's master secret arrives here, is turned into the cluster identity
//! and the state disk passphrase, and is then handed to the cluster
//! initializer together with the KMS settings.
//!
//! If the node lock is already taken (this node is joining, or a concurrent
//! init won), the caller gets `FailedPrecondition` and the server begins a
//! graceful shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::attestation::AttestationId;
use crate::config::STATE_DISK_KEY_LENGTH;
use crate::disk::{DiskSession, EncryptedDisk};
use crate::error::{Error, Result, ResultExt, RpcError};
use crate::keys::{derive_disk_passphrase, MasterSecret};
use crate::nodelock::NodeLock;
use crate::nodestate::{NodeState, NodeStateStore, Role};
use crate::wire::{self, b64};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshUserKey {
    pub username: String,
    pub public_key: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitRequest {
    #[serde(with = "b64")]
    pub master_secret: Vec<u8>,
    pub autoscaling_node_groups: Vec<String>,
    pub cloud_service_account_uri: String,
    pub kubernetes_version: String,
    pub kms_uri: String,
    pub storage_uri: String,
    pub key_encryption_key_id: String,
    pub use_existing_kek: bool,
    pub ssh_user_keys: Vec<SshUserKey>,
}

impl fmt::Debug for InitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitRequest")
            .field("master_secret", &"<redacted>")
            .field("autoscaling_node_groups", &self.autoscaling_node_groups)
            .field("kubernetes_version", &self.kubernetes_version)
            .field("kms_uri", &self.kms_uri)
            .field("storage_uri", &self.storage_uri)
            .field("key_encryption_key_id", &self.key_encryption_key_id)
            .field("use_existing_kek", &self.use_existing_kek)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    #[serde(with = "b64")]
    pub kubeconfig: Vec<u8>,
    #[serde(with = "b64")]
    pub owner_id: Vec<u8>,
    #[serde(with = "b64")]
    pub cluster_id: Vec<u8>,
}

/// KMS settings the cluster's key service is started with.
#[derive(Debug)]
pub struct KmsConfig {
    pub master_secret: MasterSecret,
    pub kms_uri: String,
    pub storage_uri: String,
    pub key_encryption_key_id: String,
    pub use_existing_kek: bool,
}

/// Everything the cluster initializer is given.
#[derive(Debug)]
pub struct ClusterInitArgs {
    pub autoscaling_node_groups: Vec<String>,
    pub cloud_service_account_uri: String,
    pub kubernetes_version: String,
    pub id: AttestationId,
    pub kms: KmsConfig,
    /// Username to public key.
    pub ssh_user_keys: HashMap<String, String>,
}

/// Brings up Kubernetes on the first node.
#[async_trait]
pub trait ClusterInitializer: Send + Sync {
    /// Returns the admin kubeconfig.
    async fn init_cluster(&self, args: ClusterInitArgs) -> Result<Vec<u8>>;
}

pub struct InitServer {
    lock: Arc<NodeLock>,
    disk: Arc<dyn EncryptedDisk>,
    initializer: Arc<dyn ClusterInitializer>,
    node_state: NodeStateStore,
    shutdown: watch::Sender<bool>,
}

impl InitServer {
    pub fn new(
        lock: Arc<NodeLock>,
        disk: Arc<dyn EncryptedDisk>,
        initializer: Arc<dyn ClusterInitializer>,
        node_state: NodeStateStore,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            lock,
            disk,
            initializer,
            node_state,
            shutdown,
        }
    }

    /// Ask a running [`serve`](Self::serve) to stop after in-flight requests.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn init(&self, req: InitRequest) -> Result<InitResponse, RpcError> {
        if !self.lock.try_lock_once() {
            warn!("init requested, but the node lock is taken; shutting down");
            self.stop();
            return Err(RpcError::failed_precondition(
                Error::NodeLocked("activated").to_string(),
            ));
        }
        info!(kubernetes_version = %req.kubernetes_version, "initializing cluster");

        let InitRequest {
            master_secret,
            autoscaling_node_groups,
            cloud_service_account_uri,
            kubernetes_version,
            kms_uri,
            storage_uri,
            key_encryption_key_id,
            use_existing_kek,
            ssh_user_keys,
        } = req;
        let master = MasterSecret::new(master_secret);

        let id = AttestationId::derive(&master).map_err(internal)?;

        self.setup_disk(&master)
            .context("setting up disk")
            .map_err(internal)?;

        let state = NodeState {
            role: Role::ControlPlane,
            owner_id: id.owner.clone(),
            cluster_id: id.cluster.clone(),
        };
        self.node_state
            .write(&state)
            .context("persisting node state")
            .map_err(internal)?;

        let args = ClusterInitArgs {
            autoscaling_node_groups,
            cloud_service_account_uri,
            kubernetes_version,
            id: id.clone(),
            kms: KmsConfig {
                master_secret: master,
                kms_uri,
                storage_uri,
                key_encryption_key_id,
                use_existing_kek,
            },
            ssh_user_keys: ssh_keys_to_map(ssh_user_keys),
        };
        let kubeconfig = self
            .initializer
            .init_cluster(args)
            .await
            .context("initializing cluster")
            .map_err(internal)?;

        info!("cluster initialized");
        Ok(InitResponse {
            kubeconfig,
            owner_id: id.owner,
            cluster_id: id.cluster,
        })
    }

    fn setup_disk(&self, master: &MasterSecret) -> Result<()> {
        let session = DiskSession::open(self.disk.as_ref())?;
        let uuid = session.uuid()?;
        let passphrase = derive_disk_passphrase(master, &uuid, STATE_DISK_KEY_LENGTH)
            .context("deriving disk passphrase")?;
        session.update_passphrase(passphrase.as_bytes())
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(wire::ROUTE_INIT, post(init))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until [`stop`](Self::stop) is called or an init
    /// request finds the node lock taken.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut stopping = self.shutdown.subscribe();
        info!(addr = ?listener.local_addr().ok(), "init server listening");
        axum::serve(listener, Arc::clone(&self).router())
            .with_graceful_shutdown(async move {
                // A closed channel also ends the server.
                let _ = stopping.wait_for(|stop| *stop).await;
                info!("init server shutting down");
            })
            .await
            .context("serving init server")
    }
}

fn internal(err: Error) -> RpcError {
    error!(error = %err, "init failed");
    RpcError::internal(err)
}

fn ssh_keys_to_map(keys: Vec<SshUserKey>) -> HashMap<String, String> {
    keys.into_iter()
        .map(|key| (key.username, key.public_key))
        .collect()
}

async fn init(
    State(server): State<Arc<InitServer>>,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, RpcError> {
    server.init(req).await.map(Json)
}

/// Client for a remote init server.
#[derive(Debug, Clone)]
pub struct InitClient {
    client: reqwest::Client,
    base_url: String,
}

impl InitClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: wire::base_url(host, port),
        }
    }

    pub async fn init(&self, req: &InitRequest) -> Result<InitResponse> {
        let url = format!("{}{}", self.base_url, wire::ROUTE_INIT);
        wire::post_json(&self.client, &url, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_keys_to_map() {
        let keys = vec![
            SshUserKey {
                username: "admin".into(),
                public_key: "ssh-ed25519 AAAA admin".into(),
            },
            SshUserKey {
                username: "ops".into(),
                public_key: "ssh-ed25519 BBBB ops".into(),
            },
        ];
        let map = ssh_keys_to_map(keys);
        assert_eq!(map.len(), 2);
        assert_eq!(map["ops"], "ssh-ed25519 BBBB ops");
        assert!(ssh_keys_to_map(Vec::new()).is_empty());
    }

    #[test]
    fn test_request_debug_is_redacted() {
        let req = InitRequest {
            master_secret: b"ConstellationTest".to_vec(),
            ..Default::default()
        };
        assert!(!format!("{req:?}").contains("ConstellationTest"));
    }

    #[test]
    fn test_request_accepts_missing_fields() {
        let req: InitRequest = serde_json::from_str(r#"{"master_secret":"Q29uc3RlbGxhdGlvblRlc3Q="}"#).unwrap();
        assert_eq!(req.master_secret, b"ConstellationTest");
        assert!(req.ssh_user_keys.is_empty());
    }
}
