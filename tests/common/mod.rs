//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use bootstrapper::attestation::{Issuer, Validator};
use bootstrapper::disk::EncryptedDisk;
use bootstrapper::error::{Error, Result, RpcError};
use bootstrapper::initserver::{ClusterInitArgs, ClusterInitializer};
use bootstrapper::joinclient::{BootstrapTokenDiscovery, ClusterJoiner, KubeletCredentials};
use bootstrapper::joinproto::{ActivationRequest, Dialer, JoinServiceApi, JoinTicket};
use bootstrapper::joinservice::{BootstrapToken, CertificateIssuer, TokenIssuer};
use bootstrapper::metadata::{InstanceMetadata, MetadataApi};
use bootstrapper::nodestate::Role;

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDisk {
    pub uuid: String,
    pub fail_uuid: bool,
    pub fail_passphrase: bool,
    pub passphrases: Mutex<Vec<Vec<u8>>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeDisk {
    pub fn new(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            ..Default::default()
        }
    }

    pub fn last_passphrase(&self) -> Option<Vec<u8>> {
        self.passphrases.lock().unwrap().last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.opened.load(Ordering::SeqCst) == self.closed.load(Ordering::SeqCst)
    }
}

impl EncryptedDisk for FakeDisk {
    fn open(&self) -> Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn uuid(&self) -> Result<String> {
        if self.fail_uuid {
            return Err(Error::Disk("no such device".into()));
        }
        Ok(self.uuid.clone())
    }

    fn update_passphrase(&self, passphrase: &[u8]) -> Result<()> {
        if self.fail_passphrase {
            return Err(Error::Disk("keyslot locked".into()));
        }
        self.passphrases.lock().unwrap().push(passphrase.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub fn instance(name: &str, role: Role, ips: &[&str]) -> InstanceMetadata {
    InstanceMetadata {
        name: name.to_string(),
        provider_id: format!("fake://{name}"),
        role,
        private_ips: ips.iter().map(|ip| ip.to_string()).collect(),
    }
}

/// Answers `self_instance` with `failures` errors first, then with `me`.
pub struct FakeMetadata {
    pub me: InstanceMetadata,
    pub instances: Vec<InstanceMetadata>,
    pub failures: AtomicUsize,
    pub self_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FakeMetadata {
    pub fn new(me: InstanceMetadata, instances: Vec<InstanceMetadata>) -> Self {
        Self {
            me,
            instances,
            failures: AtomicUsize::new(0),
            self_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MetadataApi for FakeMetadata {
    async fn list(&self) -> Result<Vec<InstanceMetadata>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.instances.clone())
    }

    async fn self_instance(&self) -> Result<InstanceMetadata> {
        self.self_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Metadata("metadata server unavailable".into()));
        }
        Ok(self.me.clone())
    }
}

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

/// Uses the user data itself as evidence.
pub struct EchoIssuer;

#[async_trait]
impl Issuer for EchoIssuer {
    async fn issue(&self, user_data: &[u8]) -> Result<Vec<u8>> {
        Ok(user_data.to_vec())
    }
}

/// Accepts evidence produced by [`EchoIssuer`] for the same user data.
pub struct EchoValidator;

#[async_trait]
impl Validator for EchoValidator {
    async fn validate(&self, evidence: &[u8], user_data: &[u8]) -> Result<()> {
        if evidence == user_data {
            Ok(())
        } else {
            Err(Error::Invalid("evidence does not match request".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

pub fn ticket(certificate_key: Option<&str>) -> JoinTicket {
    JoinTicket {
        state_disk_key: vec![0x42; 32],
        owner_id: b"owner-id".to_vec(),
        cluster_id: b"cluster-id".to_vec(),
        kubelet_key: b"kubelet-key".to_vec(),
        kubelet_cert: b"kubelet-cert".to_vec(),
        api_server_endpoint: "192.0.2.1:6443".into(),
        token: "abcdef.0123456789abcdef".into(),
        discovery_token_ca_cert_hash: "sha256:c0ffee".into(),
        certificate_key: certificate_key.map(str::to_string),
    }
}

/// Join service that rejects the first `rejections` requests.
pub struct FakeJoinService {
    pub rejections: AtomicUsize,
    pub requests: Mutex<Vec<(Role, ActivationRequest)>>,
}

impl FakeJoinService {
    pub fn new() -> Self {
        Self::rejecting_first(0)
    }

    pub fn rejecting_first(rejections: usize) -> Self {
        Self {
            rejections: AtomicUsize::new(rejections),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn answer(&self, role: Role, req: &ActivationRequest) -> Result<JoinTicket> {
        self.requests.lock().unwrap().push((role, req.clone()));
        let left = self.rejections.load(Ordering::SeqCst);
        if left > 0 {
            self.rejections.store(left - 1, Ordering::SeqCst);
            return Err(RpcError::permission_denied("evidence rejected").into());
        }
        Ok(match role {
            Role::ControlPlane => ticket(Some("certificate-key")),
            _ => ticket(None),
        })
    }
}

#[async_trait]
impl JoinServiceApi for FakeJoinService {
    async fn activate_worker_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        self.answer(Role::Worker, req)
    }

    async fn activate_control_plane_node(&self, req: &ActivationRequest) -> Result<JoinTicket> {
        self.answer(Role::ControlPlane, req)
    }
}

/// Dials services registered by IP; any other IP is unreachable.
#[derive(Default)]
pub struct InProcessDialer {
    pub services: HashMap<String, Arc<dyn JoinServiceApi>>,
    pub dials: Mutex<Vec<String>>,
}

impl InProcessDialer {
    pub fn with(mut self, ip: &str, service: Arc<dyn JoinServiceApi>) -> Self {
        self.services.insert(ip.to_string(), service);
        self
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for InProcessDialer {
    async fn dial(&self, ip: &str) -> Result<Arc<dyn JoinServiceApi>> {
        self.dials.lock().unwrap().push(ip.to_string());
        self.services
            .get(ip)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("connection refused: {ip}")))
    }
}

pub struct JoinCall {
    pub discovery: BootstrapTokenDiscovery,
    pub kubelet_key: Vec<u8>,
    pub certificate_key: Option<String>,
    pub role: Role,
}

#[derive(Default)]
pub struct FakeJoiner {
    pub calls: Mutex<Vec<JoinCall>>,
}

impl FakeJoiner {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterJoiner for FakeJoiner {
    async fn join_cluster(
        &self,
        discovery: &BootstrapTokenDiscovery,
        kubelet: &KubeletCredentials,
        certificate_key: Option<&str>,
        role: Role,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(JoinCall {
            discovery: discovery.clone(),
            kubelet_key: kubelet.key.clone(),
            certificate_key: certificate_key.map(str::to_string),
            role,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Join service collaborators
// ---------------------------------------------------------------------------

pub struct FakeTokens {
    pub valid_for: ChronoDuration,
}

impl FakeTokens {
    pub fn valid() -> Self {
        Self {
            valid_for: ChronoDuration::hours(1),
        }
    }

    pub fn expired() -> Self {
        Self {
            valid_for: ChronoDuration::seconds(-1),
        }
    }
}

#[async_trait]
impl TokenIssuer for FakeTokens {
    async fn bootstrap_token(&self, _node_name: &str) -> Result<BootstrapToken> {
        Ok(BootstrapToken {
            api_server_endpoint: "10.9.0.1:6443".into(),
            token: "abcdef.0123456789abcdef".into(),
            discovery_token_ca_cert_hash: "sha256:c0ffee".into(),
            expires_at: Utc::now() + self.valid_for,
        })
    }

    async fn certificate_key(&self) -> Result<String> {
        Ok("certificate-key".into())
    }
}

pub struct FakeCertificates;

#[async_trait]
impl CertificateIssuer for FakeCertificates {
    async fn kubelet_credentials(&self, node_name: &str) -> Result<KubeletCredentials> {
        Ok(KubeletCredentials {
            key: format!("key-{node_name}").into_bytes(),
            cert: format!("cert-{node_name}").into_bytes(),
        })
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// What the cluster initializer saw, minus the master secret.
#[derive(Debug, Clone)]
pub struct SeenInit {
    pub kubernetes_version: String,
    pub kms_uri: String,
    pub storage_uri: String,
    pub key_encryption_key_id: String,
    pub use_existing_kek: bool,
    pub master_secret: Vec<u8>,
    pub ssh_user_keys: HashMap<String, String>,
    pub owner_id: Vec<u8>,
}

#[derive(Default)]
pub struct FakeInitializer {
    pub seen: Mutex<Vec<SeenInit>>,
}

#[async_trait]
impl ClusterInitializer for FakeInitializer {
    async fn init_cluster(&self, args: ClusterInitArgs) -> Result<Vec<u8>> {
        self.seen.lock().unwrap().push(SeenInit {
            kubernetes_version: args.kubernetes_version.clone(),
            kms_uri: args.kms.kms_uri.clone(),
            storage_uri: args.kms.storage_uri.clone(),
            key_encryption_key_id: args.kms.key_encryption_key_id.clone(),
            use_existing_kek: args.kms.use_existing_kek,
            master_secret: args.kms.master_secret.as_bytes().to_vec(),
            ssh_user_keys: args.ssh_user_keys.clone(),
            owner_id: args.id.owner.clone(),
        });
        Ok(format!("kubeconfig for {}", args.kubernetes_version).into_bytes())
    }
}
