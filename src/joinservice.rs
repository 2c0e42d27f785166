//! Join service.
//!
//! Runs on every control-plane node that is already part of the cluster and
//! hands out [`JoinTicket`]s to nodes whose attestation it trusts. No key
//! material is touched before the evidence has been validated.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::attestation::{join_user_data, Validator};
use crate::config::STATE_DISK_KEY_LENGTH;
use crate::error::{Error, Result, ResultExt, RpcError};
use crate::joinclient::KubeletCredentials;
use crate::joinproto::{ActivationRequest, JoinServiceApi, JoinTicket};
use crate::kms::CloudKms;
use crate::nodestate::{NodeStateStore, Role};
use crate::wire;

/// A Kubernetes bootstrap token and what a node needs to use it.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    pub api_server_endpoint: String,
    pub token: String,
    pub discovery_token_ca_cert_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Creates bootstrap tokens on the control plane.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn bootstrap_token(&self, node_name: &str) -> Result<BootstrapToken>;
    /// Key that decrypts the control plane certificates uploaded to the
    /// cluster.
    async fn certificate_key(&self) -> Result<String>;
}

/// Signs kubelet client certificates.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn kubelet_credentials(&self, node_name: &str) -> Result<KubeletCredentials>;
}

/// Name of the DEK that serves as state disk key of the disk `disk_uuid`.
pub fn state_disk_dek_name(disk_uuid: &str) -> String {
    format!("disk-{}", disk_uuid.to_lowercase())
}

/// External collaborators of a [`JoinService`].
pub struct JoinServiceDeps {
    pub validator: Arc<dyn Validator>,
    pub kms: Arc<dyn CloudKms>,
    pub node_state: NodeStateStore,
    pub certificates: Arc<dyn CertificateIssuer>,
    pub tokens: Arc<dyn TokenIssuer>,
}

pub struct JoinService {
    deps: JoinServiceDeps,
    kek_id: String,
}

impl JoinService {
    pub fn new(deps: JoinServiceDeps, kek_id: impl Into<String>) -> Self {
        Self {
            deps,
            kek_id: kek_id.into(),
        }
    }

    pub async fn activate_worker(&self, req: &ActivationRequest) -> Result<JoinTicket, RpcError> {
        self.activate(req, Role::Worker).await
    }

    pub async fn activate_control_plane(&self, req: &ActivationRequest) -> Result<JoinTicket, RpcError> {
        self.activate(req, Role::ControlPlane).await
    }

    async fn activate(&self, req: &ActivationRequest, role: Role) -> Result<JoinTicket, RpcError> {
        info!(node = %req.node_name, %role, "activation requested");

        let user_data = join_user_data(&req.disk_uuid, &req.node_name);
        if let Err(err) = self.deps.validator.validate(&req.attestation, &user_data).await {
            warn!(node = %req.node_name, error = %err, "attestation rejected");
            return Err(RpcError::permission_denied(format!("validating attestation: {err}")));
        }

        match self.issue_ticket(req, role).await {
            Ok(ticket) => {
                info!(node = %req.node_name, %role, "join ticket issued");
                Ok(ticket)
            }
            Err(err) => {
                error!(node = %req.node_name, error = %err, "issuing join ticket failed");
                Err(RpcError::internal(err))
            }
        }
    }

    async fn issue_ticket(&self, req: &ActivationRequest, role: Role) -> Result<JoinTicket> {
        let state_disk_key = self
            .deps
            .kms
            .get_dek(&self.kek_id, &state_disk_dek_name(&req.disk_uuid), STATE_DISK_KEY_LENGTH)
            .await
            .context("getting state disk key")?;

        let state = self.deps.node_state.read().context("reading node state")?;

        let kubelet = self
            .deps
            .certificates
            .kubelet_credentials(&req.node_name)
            .await
            .context("issuing kubelet credentials")?;

        let token = self
            .deps
            .tokens
            .bootstrap_token(&req.node_name)
            .await
            .context("creating bootstrap token")?;
        if token.expires_at <= Utc::now() {
            return Err(Error::Invalid(format!(
                "bootstrap token expired at {}",
                token.expires_at.to_rfc3339()
            )));
        }

        let certificate_key = match role {
            Role::ControlPlane => Some(
                self.deps
                    .tokens
                    .certificate_key()
                    .await
                    .context("creating certificate key")?,
            ),
            _ => None,
        };

        Ok(JoinTicket {
            state_disk_key,
            owner_id: state.owner_id,
            cluster_id: state.cluster_id,
            kubelet_key: kubelet.key,
            kubelet_cert: kubelet.cert,
            api_server_endpoint: token.api_server_endpoint,
            token: token.token,
            discovery_token_ca_cert_hash: token.discovery_token_ca_cert_hash,
            certificate_key,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(wire::ROUTE_ACTIVATE_WORKER, post(activate_worker))
            .route(wire::ROUTE_ACTIVATE_CONTROL_PLANE, post(activate_control_plane))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }
}

async fn activate_worker(
    State(service): State<Arc<JoinService>>,
    Json(req): Json<ActivationRequest>,
) -> Result<Json<JoinTicket>, RpcError> {
    service.activate_worker(&req).await.map(Json)
}

async fn activate_control_plane(
    State(service): State<Arc<JoinService>>,
    Json(req): Json<ActivationRequest>,
) -> Result<Json<JoinTicket>, RpcError> {
    service.activate_control_plane(&req).await.map(Json)
}

#[async_trait]
impl JoinServiceApi for JoinService {
    async fn activate_worker_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        Ok(self.activate_worker(req).await?)
    }

    async fn activate_control_plane_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        Ok(self.activate_control_plane(req).await?)
    }
}

/// Serve `service` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Arc<JoinService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr().ok(), "join service listening");
    axum::serve(listener, service.router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving join service")
}
