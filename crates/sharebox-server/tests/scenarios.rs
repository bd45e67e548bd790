//! End-to-end scenarios: a real server on 127.0.0.1 and library clients.

use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sharebox_client::{Client, FileResult};
use sharebox_crypto::{FileKeyStore, KdfParams, KeyProvider};
use sharebox_server::{AppState, ConnectionOptions, Server, ServerError, ShutdownHandle};
use sharebox_store::{IntegrityGuard, MetadataStore, WORKSPACES_DIR, WorkspaceStorage};
use sharebox_transfer::{FramedChannel, TransferError};
use sharebox_types::{AuthStatus, FileOutcome, Status};

const PARAMS: KdfParams = KdfParams::for_tests();
const KEY_PASSPHRASE: &str = "key-pass";

struct Harness {
    dir: tempfile::TempDir,
    addr: SocketAddr,
    keys: Arc<FileKeyStore>,
    shutdown: ShutdownHandle,
    server: JoinHandle<Result<(), ServerError>>,
}

impl Harness {
    fn start() -> Self {
        Self::start_with(None)
    }

    fn start_with(max_auth_attempts: Option<u32>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();

        let keys = Arc::new(FileKeyStore::open(dir.path().join("keys")).unwrap().with_params(PARAMS));
        let (guard, _) = IntegrityGuard::open(&data, "admin", &PARAMS, || true).unwrap();
        let state = Arc::new(AppState {
            metadata: MetadataStore::open(&data, guard, PARAMS).unwrap(),
            storage: WorkspaceStorage::open(data.join(WORKSPACES_DIR)).unwrap(),
            keys: keys.clone(),
        });
        let options = ConnectionOptions {
            buffer_size: 1024,
            socket_timeout: Some(Duration::from_secs(10)),
            max_auth_attempts,
        };

        let server = Server::bind("127.0.0.1:0", state, options).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let server = std::thread::spawn(move || server.run());
        Self { dir, addr, keys, shutdown, server }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.data_dir().join(WORKSPACES_DIR).join(workspace)
    }

    /// Give an identity a keypair on both sides.
    fn register(&self, identity: &str) {
        self.keys.generate(identity, KEY_PASSPHRASE).unwrap();
    }

    fn connect(&self, identity: &str) -> Client<TcpStream> {
        let secret = self.keys.private_key_of_local_user(identity, KEY_PASSPHRASE).unwrap();
        Client::connect(self.addr, identity, secret, self.keys.clone()).unwrap()
    }

    fn login(&self, identity: &str, password: &str) -> Client<TcpStream> {
        let mut client = self.connect(identity);
        let status = client.authenticate(password).unwrap();
        assert!(status.is_authenticated(), "{identity} got {status}");
        client
    }

    fn stop(self) -> Result<(), ServerError> {
        self.shutdown.shutdown();
        self.server.join().unwrap()
    }
}

fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let content: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
    fs::write(&path, content).unwrap();
    path
}

/// alice owns `reports` with bob as a member.
fn shared_workspace(h: &Harness) -> (Client<TcpStream>, Client<TcpStream>) {
    h.register("alice");
    h.register("bob");
    let mut alice = h.login("alice", "alice-pw");
    let bob = h.login("bob", "bob-pw");
    assert_eq!(alice.create_workspace("reports", "team-secret").unwrap(), Status::Ok);
    assert_eq!(alice.add_member("bob", "reports").unwrap(), Status::Ok);
    (alice, bob)
}

#[test]
fn new_user_is_provisioned_with_personal_workspace() {
    let h = Harness::start();
    h.register("alice");

    let mut alice = h.connect("alice");
    assert_eq!(alice.authenticate("pw").unwrap(), AuthStatus::NewUser);
    assert_eq!(alice.list_workspaces().unwrap(), vec!["workspacealice"]);
    assert_eq!(alice.list_files("workspacealice").unwrap(), (Status::Ok, vec![]));
    assert!(h.workspace_dir("workspacealice").join("workspacealice.key.alice").exists());
    drop(alice);

    let mut again = h.connect("alice");
    assert_eq!(again.authenticate("pw").unwrap(), AuthStatus::Authenticated);
    drop(again);
    h.stop().unwrap();
}

#[test]
fn wrong_password_can_be_retried_on_the_same_connection() {
    let h = Harness::start();
    h.register("alice");
    drop(h.login("alice", "pw"));

    let mut alice = h.connect("alice");
    assert_eq!(alice.authenticate("nope").unwrap(), AuthStatus::WrongPassword);
    assert_eq!(alice.authenticate("still-nope").unwrap(), AuthStatus::WrongPassword);
    assert_eq!(alice.authenticate("pw").unwrap(), AuthStatus::Authenticated);
    assert_eq!(alice.list_workspaces().unwrap(), vec!["workspacealice"]);
    drop(alice);
    h.stop().unwrap();
}

#[test]
fn attempt_limit_rejects_and_closes() {
    let h = Harness::start_with(Some(2));
    h.register("alice");
    drop(h.login("alice", "pw"));

    let mut alice = h.connect("alice");
    assert_eq!(alice.authenticate("nope").unwrap(), AuthStatus::WrongPassword);
    assert_eq!(alice.authenticate("nope").unwrap(), AuthStatus::Rejected);
    assert!(alice.authenticate("pw").is_err());
    h.stop().unwrap();
}

#[test]
fn identity_without_public_key_is_refused() {
    let h = Harness::start();
    h.register("alice");
    let secret = h.keys.private_key_of_local_user("alice", KEY_PASSPHRASE).unwrap();

    let mut mallory = Client::connect(h.addr, "mallory", secret, h.keys.clone()).unwrap();
    assert_eq!(mallory.authenticate("pw").unwrap(), AuthStatus::Rejected);
    assert!(!mallory.is_authenticated());
    h.stop().unwrap();
}

#[test]
fn upload_by_alice_downloads_for_bob() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    let local = tempfile::tempdir().unwrap();
    let source = write_source(local.path(), "report.txt", 10 * 1024);

    let report = alice.upload("reports", &[&source]).unwrap();
    assert_eq!(report.status, Status::Ok);
    assert_eq!(report.result("report.txt"), Some(&FileResult::Remote(FileOutcome::Ok)));

    let dest = tempfile::tempdir().unwrap();
    let report = bob.download("reports", &["report.txt"], dest.path()).unwrap();
    match report.result("report.txt") {
        Some(FileResult::Downloaded { signer, path }) => {
            assert_eq!(signer, "alice");
            assert_eq!(fs::read(path).unwrap(), fs::read(&source).unwrap());
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(dest.path().join("report.txt.signed.alice").exists());

    // The server never holds the plaintext.
    let stored = fs::read(h.workspace_dir("reports").join("report.txt")).unwrap();
    assert_ne!(stored, fs::read(&source).unwrap());

    drop((alice, bob));
    h.stop().unwrap();
}

#[test]
fn tampered_ciphertext_is_reported_and_discarded() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    let local = tempfile::tempdir().unwrap();
    let source = write_source(local.path(), "report.txt", 10 * 1024);
    alice.upload("reports", &[&source]).unwrap();

    let stored = h.workspace_dir("reports").join("report.txt");
    let mut bytes = fs::read(&stored).unwrap();
    bytes[100] ^= 0x01;
    fs::write(&stored, bytes).unwrap();

    let dest = tempfile::tempdir().unwrap();
    let report = bob.download("reports", &["report.txt"], dest.path()).unwrap();
    assert_eq!(report.result("report.txt"), Some(&FileResult::Corrupted { signer: "alice".into() }));
    assert!(!dest.path().join("report.txt").exists());
    assert!(dest.path().join("report.txt.signed.alice").exists());

    // The connection is still usable.
    assert_eq!(bob.list_files("reports").unwrap().1, vec!["report.txt"]);
    drop((alice, bob));
    h.stop().unwrap();
}

#[test]
fn replacement_upload_takes_the_new_signer() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    let local = tempfile::tempdir().unwrap();
    let source = write_source(local.path(), "plan.md", 3000);

    alice.upload("reports", &[&source]).unwrap();
    bob.upload("reports", &[&source]).unwrap();

    let dir = h.workspace_dir("reports");
    assert!(!dir.join("plan.md.signed.alice").exists());
    assert!(dir.join("plan.md.signed.bob").exists());

    let dest = tempfile::tempdir().unwrap();
    let report = alice.download("reports", &["plan.md"], dest.path()).unwrap();
    assert!(matches!(report.result("plan.md"), Some(FileResult::Downloaded { signer, .. }) if signer == "bob"));
    drop((alice, bob));
    h.stop().unwrap();
}

#[test]
fn permission_checks_return_structured_statuses() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    h.register("carol");
    let mut carol = h.login("carol", "carol-pw");

    assert_eq!(alice.add_member("dave", "reports").unwrap(), Status::NoUser);
    assert_eq!(alice.add_member("carol", "nowhere").unwrap(), Status::NoWorkspace);
    assert_eq!(bob.add_member("carol", "reports").unwrap(), Status::NoPermission);

    // Adding an existing member leaves its envelope alone.
    let envelope = h.workspace_dir("reports").join("reports.key.bob");
    let before = fs::read(&envelope).unwrap();
    assert_eq!(alice.add_member("bob", "reports").unwrap(), Status::Ok);
    assert_eq!(fs::read(&envelope).unwrap(), before);

    assert_eq!(carol.list_files("reports").unwrap().0, Status::NoPermission);
    let local = tempfile::tempdir().unwrap();
    let source = write_source(local.path(), "x.txt", 10);
    assert_eq!(carol.upload("reports", &[&source]).unwrap().status, Status::NoPermission);
    assert_eq!(carol.remove("reports", &["x.txt"]).unwrap().status, Status::NoPermission);
    assert_eq!(carol.list_files("missing").unwrap().0, Status::NoWorkspace);

    assert_eq!(alice.create_workspace("reports", "other").unwrap(), Status::Nok);
    assert_eq!(alice.create_workspace("workspacecarol", "pw").unwrap(), Status::Nok);
    assert_eq!(carol.list_workspaces().unwrap(), vec!["workspacecarol"]);
    assert_eq!(bob.list_workspaces().unwrap(), vec!["reports", "workspacebob"]);

    drop((alice, bob, carol));
    h.stop().unwrap();
}

#[test]
fn existing_member_envelope_cannot_be_replaced() {
    let h = Harness::start();
    let (alice, mut bob) = shared_workspace(&h);
    drop(alice);
    let envelope = h.workspace_dir("reports").join("reports.key.bob");
    let before = fs::read(&envelope).unwrap();

    // An owner client that would answer with garbage is never asked.
    let mut raw = FramedChannel::new(TcpStream::connect(h.addr).unwrap());
    raw.send_message("alice").unwrap();
    raw.send_message("alice-pw").unwrap();
    assert_eq!(raw.receive_message().unwrap(), "OK-USER");
    raw.send_message("ADD bob reports").unwrap();
    assert_eq!(raw.receive_message().unwrap(), "OK");
    assert!(raw.receive_bytes(1024).unwrap().is_empty());
    raw.send_message("LW").unwrap();
    assert_eq!(raw.receive_message().unwrap(), "{ reports, workspacealice }");

    assert_eq!(fs::read(&envelope).unwrap(), before);
    assert_eq!(bob.list_files("reports").unwrap().0, Status::Ok);
    drop((raw, bob));
    h.stop().unwrap();
}

#[test]
fn local_failure_on_one_download_does_not_abort_the_batch() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    let local = tempfile::tempdir().unwrap();
    let a = write_source(local.path(), "a.txt", 3000);
    let b = write_source(local.path(), "b.txt", 5000);
    assert!(alice.upload("reports", &[&a, &b]).unwrap().files.iter().all(|(_, r)| r.is_success()));

    // The signature artifact for a.txt cannot be written.
    let dest = tempfile::tempdir().unwrap();
    fs::create_dir(dest.path().join("a.txt.signed.alice")).unwrap();

    let report = bob.download("reports", &["a.txt", "b.txt"], dest.path()).unwrap();
    assert_eq!(report.status, Status::Ok);
    assert!(matches!(report.result("a.txt"), Some(FileResult::Local(_))));
    assert!(!dest.path().join("a.txt").exists());
    match report.result("b.txt") {
        Some(FileResult::Downloaded { path, .. }) => assert_eq!(fs::read(path).unwrap(), fs::read(&b).unwrap()),
        other => panic!("unexpected result {other:?}"),
    }

    // The connection is still in sync.
    assert_eq!(bob.list_files("reports").unwrap().1, vec!["a.txt", "b.txt"]);
    drop((alice, bob));
    h.stop().unwrap();
}

#[test]
fn remove_and_list_files() {
    let h = Harness::start();
    let (mut alice, mut bob) = shared_workspace(&h);
    let local = tempfile::tempdir().unwrap();
    let a = write_source(local.path(), "a.txt", 100);
    let b = write_source(local.path(), "b.txt", 0);

    let report = alice.upload("reports", &[&b, &a]).unwrap();
    assert!(report.files.iter().all(|(_, r)| r.is_success()));
    assert_eq!(bob.list_files("reports").unwrap(), (Status::Ok, vec!["a.txt".into(), "b.txt".into()]));

    let report = bob.remove("reports", &["a.txt", "missing.txt"]).unwrap();
    assert_eq!(report.result("a.txt"), Some(&FileResult::Remote(FileOutcome::Deleted)));
    assert_eq!(report.result("missing.txt"), Some(&FileResult::Remote(FileOutcome::NotFound)));
    assert_eq!(alice.list_files("reports").unwrap().1, vec!["b.txt"]);
    assert!(!h.workspace_dir("reports").join("a.txt.signed.alice").exists());

    let dest = tempfile::tempdir().unwrap();
    let report = bob.download("reports", &["a.txt", "b.txt"], dest.path()).unwrap();
    assert_eq!(report.result("a.txt"), Some(&FileResult::Remote(FileOutcome::NotFound)));
    assert!(matches!(report.result("b.txt"), Some(FileResult::Downloaded { .. })));
    assert_eq!(fs::read(dest.path().join("b.txt")).unwrap(), Vec::<u8>::new());

    drop((alice, bob));
    h.stop().unwrap();
}

#[test]
fn malformed_command_closes_only_that_connection() {
    let h = Harness::start();
    h.register("alice");
    let mut healthy = h.login("alice", "pw");

    let mut raw = FramedChannel::new(TcpStream::connect(h.addr).unwrap());
    raw.send_message("alice").unwrap();
    raw.send_message("pw").unwrap();
    assert_eq!(raw.receive_message().unwrap(), "OK-USER");
    raw.send_message("FETCH everything").unwrap();
    assert!(matches!(raw.receive_message(), Err(TransferError::Disconnected) | Err(TransferError::Io(_))));

    assert_eq!(healthy.list_workspaces().unwrap(), vec!["workspacealice"]);
    drop(healthy);
    h.stop().unwrap();
}

#[test]
fn tampered_metadata_stops_the_server() {
    let h = Harness::start();
    h.register("alice");
    h.register("bob");
    let mut alice = h.login("alice", "pw");

    let users = h.data_dir().join("users.txt");
    let mut text = fs::read_to_string(&users).unwrap();
    text.push_str("mallory:AAAA:AAAA\n");
    fs::write(&users, text).unwrap();

    let mut bob = h.connect("bob");
    assert!(bob.authenticate("pw").is_err());

    assert!(matches!(h.server.join().unwrap(), Err(ServerError::IntegrityViolation)));
    // In-flight sessions were shut down too.
    assert!(alice.list_workspaces().is_err());
    assert!(!fs::read_to_string(&users).unwrap().contains("bob"));
}
