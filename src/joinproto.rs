//! Join protocol messages and client.
//!
//! A joining node sends its disk UUID, its node name and attestation evidence
//! bound to both. A control-plane peer that trusts the evidence answers with a
//! [`JoinTicket`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::wire::{self, b64};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub disk_uuid: String,
    pub node_name: String,
    #[serde(with = "b64")]
    pub attestation: Vec<u8>,
}

/// Everything a node needs to join the cluster. Consumed right after receipt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTicket {
    #[serde(with = "b64")]
    pub state_disk_key: Vec<u8>,
    #[serde(with = "b64")]
    pub owner_id: Vec<u8>,
    #[serde(with = "b64")]
    pub cluster_id: Vec<u8>,
    #[serde(with = "b64")]
    pub kubelet_key: Vec<u8>,
    #[serde(with = "b64")]
    pub kubelet_cert: Vec<u8>,
    pub api_server_endpoint: String,
    pub token: String,
    pub discovery_token_ca_cert_hash: String,
    /// Only set for control-plane nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
}

impl std::fmt::Debug for JoinTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinTicket")
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("control_plane", &self.certificate_key.is_some())
            .finish_non_exhaustive()
    }
}

/// The join service as seen by a joining node.
#[async_trait]
pub trait JoinServiceApi: Send + Sync {
    async fn activate_worker_node(&self, req: &ActivationRequest) -> Result<JoinTicket>;
    async fn activate_control_plane_node(&self, req: &ActivationRequest) -> Result<JoinTicket>;
}

/// Connects to the join service of one control-plane node.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ip: &str) -> Result<Arc<dyn JoinServiceApi>>;
}

/// Join service client over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpJoinService {
    client: Client,
    base_url: String,
}

impl HttpJoinService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl JoinServiceApi for HttpJoinService {
    async fn activate_worker_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        let url = format!("{}{}", self.base_url, wire::ROUTE_ACTIVATE_WORKER);
        wire::post_json(&self.client, &url, req).await
    }

    async fn activate_control_plane_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        let url = format!("{}{}", self.base_url, wire::ROUTE_ACTIVATE_CONTROL_PLANE);
        wire::post_json(&self.client, &url, req).await
    }
}

/// Dials join services at a fixed port.
#[derive(Debug, Clone)]
pub struct HttpDialer {
    client: Client,
    port: u16,
}

impl HttpDialer {
    pub fn new(port: u16) -> Self {
        Self {
            client: Client::new(),
            port,
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, ip: &str) -> Result<Arc<dyn JoinServiceApi>> {
        Ok(Arc::new(HttpJoinService::new(
            self.client.clone(),
            wire::base_url(ip, self.port),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> JoinTicket {
        JoinTicket {
            state_disk_key: vec![1; 32],
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
            kubelet_key: b"key".to_vec(),
            kubelet_cert: b"cert".to_vec(),
            api_server_endpoint: "192.0.2.1:6443".into(),
            token: "abcdef.0123456789abcdef".into(),
            discovery_token_ca_cert_hash: "sha256:00".into(),
            certificate_key: None,
        }
    }

    #[test]
    fn test_worker_ticket_omits_certificate_key() {
        let json = serde_json::to_string(&ticket()).unwrap();
        assert!(!json.contains("certificate_key"));
        let back: JoinTicket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ticket());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", ticket());
        assert!(!rendered.contains("abcdef"));
        assert!(rendered.contains("192.0.2.1:6443"));
    }
}
