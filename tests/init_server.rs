//! Init server: one successful init per node, identity derivation, and the
//! shutdown that follows a refused init.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use bootstrapper::attestation::derive_owner_id;
use bootstrapper::config::STATE_DISK_KEY_LENGTH;
use bootstrapper::error::{Error, RpcCode};
use bootstrapper::initserver::{InitClient, InitRequest, InitServer, SshUserKey};
use bootstrapper::keys::{derive_disk_passphrase, MasterSecret};
use bootstrapper::nodelock::NodeLock;
use bootstrapper::nodestate::{NodeStateStore, Role};

use common::{FakeDisk, FakeInitializer};

const MASTER: &[u8] = b"ConstellationTest";

struct Harness {
    lock: Arc<NodeLock>,
    disk: Arc<FakeDisk>,
    initializer: Arc<FakeInitializer>,
    state: NodeStateStore,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_disk(FakeDisk::new("8E4D0A1C-UPPER"))
    }

    fn with_disk(disk: FakeDisk) -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            lock: Arc::new(NodeLock::new()),
            disk: Arc::new(disk),
            initializer: Arc::new(FakeInitializer::default()),
            state: NodeStateStore::new(dir.path().join("node_state.json")),
            _dir: dir,
        }
    }

    fn server(&self) -> InitServer {
        InitServer::new(
            self.lock.clone(),
            self.disk.clone(),
            self.initializer.clone(),
            self.state.clone(),
        )
    }
}

fn request() -> InitRequest {
    InitRequest {
        master_secret: MASTER.to_vec(),
        kubernetes_version: "v1.30".into(),
        kms_uri: "kms://cluster-kms".into(),
        storage_uri: "storage://no-store".into(),
        key_encryption_key_id: "kek".into(),
        ssh_user_keys: vec![SshUserKey {
            username: "admin".into(),
            public_key: "ssh-ed25519 AAAA admin".into(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_init_derives_identity_and_sets_up_disk() {
    let h = Harness::new();
    let server = h.server();

    let resp = server.init(request()).await.unwrap();

    let master = MasterSecret::new(MASTER.to_vec());
    assert_eq!(resp.owner_id, derive_owner_id(&master).unwrap());
    assert_eq!(resp.cluster_id.len(), 32);
    assert_eq!(resp.kubeconfig, b"kubeconfig for v1.30");

    // The passphrase depends on the lowercased disk UUID only.
    let expected = derive_disk_passphrase(&master, "8e4d0a1c-upper", STATE_DISK_KEY_LENGTH).unwrap();
    assert_eq!(h.disk.last_passphrase().unwrap(), expected.as_bytes());
    assert!(h.disk.is_closed());

    let state = h.state.read().unwrap();
    assert_eq!(state.role, Role::ControlPlane);
    assert_eq!(state.owner_id, resp.owner_id);
    assert_eq!(state.cluster_id, resp.cluster_id);

    let seen = h.initializer.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].master_secret, MASTER);
    assert_eq!(seen[0].kms_uri, "kms://cluster-kms");
    assert_eq!(seen[0].storage_uri, "storage://no-store");
    assert_eq!(seen[0].key_encryption_key_id, "kek");
    assert!(!seen[0].use_existing_kek);
    assert_eq!(seen[0].owner_id, resp.owner_id);
    assert_eq!(seen[0].ssh_user_keys["admin"], "ssh-ed25519 AAAA admin");

    assert!(!server.is_stopping());
}

#[tokio::test]
async fn test_same_master_secret_new_cluster_id() {
    // Two clusters from one master secret share the owner, not the cluster.
    let first = Harness::new().server().init(request()).await.unwrap();
    let second = Harness::new().server().init(request()).await.unwrap();

    assert_eq!(first.owner_id, second.owner_id);
    assert_ne!(first.cluster_id, second.cluster_id);
}

#[tokio::test]
async fn test_second_init_fails_precondition_and_stops() {
    let h = Harness::new();
    let server = h.server();

    server.init(request()).await.unwrap();
    let err = server.init(request()).await.unwrap_err();

    assert_eq!(err.code, RpcCode::FailedPrecondition);
    assert!(err.message.contains("already being activated"));
    assert!(server.is_stopping());
    assert_eq!(h.initializer.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_init_refused_while_joining() {
    let h = Harness::new();
    assert!(h.lock.try_lock_once());
    let server = h.server();

    let err = server.init(request()).await.unwrap_err();

    assert_eq!(err.code, RpcCode::FailedPrecondition);
    assert!(server.is_stopping());
    assert!(h.disk.last_passphrase().is_none());
    assert!(!h.state.exists());
}

#[tokio::test]
async fn test_disk_failure_is_internal() {
    let h = Harness::with_disk(FakeDisk {
        fail_passphrase: true,
        ..FakeDisk::new("8E4D0A1C")
    });
    let server = h.server();

    let err = server.init(request()).await.unwrap_err();

    assert_eq!(err.code, RpcCode::Internal);
    assert!(err.message.starts_with("setting up disk"));
    assert!(h.disk.is_closed());
    assert!(!h.state.exists());
    assert!(h.initializer.seen.lock().unwrap().is_empty());
    // The lock stays taken: the node is neither joinable nor re-initializable.
    assert!(h.lock.is_locked());
}

#[tokio::test]
async fn test_init_over_http_then_shutdown() {
    let h = Harness::new();
    let server = Arc::new(h.server());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = tokio::spawn(Arc::clone(&server).serve(listener));

    let client = InitClient::new("127.0.0.1", port);
    let resp = client.init(&request()).await.unwrap();
    assert_eq!(resp.owner_id, derive_owner_id(&MasterSecret::new(MASTER.to_vec())).unwrap());

    match client.init(&request()).await.unwrap_err().root() {
        Error::Rpc(rpc) => assert_eq!(rpc.code, RpcCode::FailedPrecondition),
        other => panic!("expected an RPC error, got {other}"),
    }

    // The refused init triggered a graceful shutdown.
    drop(client);
    let result = tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(result.is_ok());
}
