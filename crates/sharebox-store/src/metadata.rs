/// The flat-file metadata store.
///
/// Each file has its own lock, held across read → compute → write → seal.
/// No operation holds both locks at once. Every public operation first
/// re-verifies both files against their MACs.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use sharebox_crypto::{KdfParams, PasswordVerifier};
use sharebox_types::models::{validate_identity, validate_workspace_name};
use sharebox_types::{RecordError, Status, UserRecord, WorkspaceRecord};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::integrity::{IntegrityGuard, MetadataKind};
use crate::{read_or_empty, write_atomic};

/// Result of a password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Identity was unknown and has been provisioned with this password.
    NewUser,
    Authenticated,
    WrongPassword,
}

/// Result of an ownership or membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    NoPermission,
    NoWorkspace,
}

impl From<Access> for Status {
    fn from(access: Access) -> Self {
        match access {
            Access::Granted => Status::Ok,
            Access::NoPermission => Status::NoPermission,
            Access::NoWorkspace => Status::NoWorkspace,
        }
    }
}

pub struct MetadataStore {
    root: PathBuf,
    users: Mutex<()>,
    workspaces: Mutex<()>,
    integrity: IntegrityGuard,
    params: KdfParams,
}

impl MetadataStore {
    /// Open the store in `root`, creating empty metadata files if absent.
    pub fn open(root: impl Into<PathBuf>, integrity: IntegrityGuard, params: KdfParams) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        for kind in MetadataKind::ALL {
            let path = root.join(kind.file_name());
            if !path.exists() {
                fs::write(&path, b"")?;
            }
        }
        info!("Metadata store at {} (integrity {:?})", root.display(), integrity.mode());
        Ok(Self {
            root,
            users: Mutex::new(()),
            workspaces: Mutex::new(()),
            integrity,
            params,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn integrity(&self) -> &IntegrityGuard {
        &self.integrity
    }

    pub fn kdf_params(&self) -> &KdfParams {
        &self.params
    }

    fn lock(&self, kind: MetadataKind) -> parking_lot::MutexGuard<'_, ()> {
        match kind {
            MetadataKind::Users => self.users.lock(),
            MetadataKind::Workspaces => self.workspaces.lock(),
        }
    }

    /// Re-verify both files, each under its own lock.
    pub fn verify_all(&self) -> Result<(), StoreError> {
        for kind in MetadataKind::ALL {
            let _guard = self.lock(kind);
            self.read_verified(kind)?;
        }
        Ok(())
    }

    // Caller holds the lock for `kind`.
    fn read_verified(&self, kind: MetadataKind) -> Result<String, StoreError> {
        let data = read_or_empty(&self.root.join(kind.file_name()))?;
        self.integrity.check(kind, &data)?;
        // A MAC-valid file is always ours; lossy decoding only guards the disabled mode.
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    // Caller holds the lock for `kind`.
    fn read_records<T>(&self, kind: MetadataKind) -> Result<Vec<T>, StoreError>
    where
        T: FromStr<Err = RecordError>,
    {
        self.read_verified(kind)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.parse()
                    .map_err(|source| StoreError::Record { file: kind.file_name(), source })
            })
            .collect()
    }

    // Caller holds the lock for `kind`.
    fn write_records<T: Display>(&self, kind: MetadataKind, records: &[T]) -> Result<(), StoreError> {
        let mut data = String::new();
        for record in records {
            data.push_str(&record.to_string());
            data.push('\n');
        }
        write_atomic(&self.root.join(kind.file_name()), data.as_bytes())?;
        self.integrity.seal(kind, data.as_bytes())
    }

    fn find_workspace(&self, name: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        let _guard = self.lock(MetadataKind::Workspaces);
        let records: Vec<WorkspaceRecord> = self.read_records(MetadataKind::Workspaces)?;
        Ok(records.into_iter().find(|ws| ws.name == name))
    }

    // ── Users ──

    pub fn user_exists(&self, identity: &str) -> Result<bool, StoreError> {
        self.verify_all()?;
        let _guard = self.lock(MetadataKind::Users);
        let users: Vec<UserRecord> = self.read_records(MetadataKind::Users)?;
        Ok(users.iter().any(|u| u.identity == identity))
    }

    /// Check the password of a known identity, or provision an unknown one.
    /// Lookup and provisioning happen under one hold of the users lock.
    pub fn authenticate_or_create(&self, identity: &str, password: &str) -> Result<AuthOutcome, StoreError> {
        validate_identity(identity)?;
        self.verify_all()?;

        let _guard = self.lock(MetadataKind::Users);
        let mut users: Vec<UserRecord> = self.read_records(MetadataKind::Users)?;

        if let Some(user) = users.iter().find(|u| u.identity == identity) {
            let verifier = PasswordVerifier { digest: user.digest.clone(), salt: user.salt.clone() };
            return Ok(if verifier.matches(password)? {
                AuthOutcome::Authenticated
            } else {
                AuthOutcome::WrongPassword
            });
        }

        let verifier = PasswordVerifier::create(password, &self.params)?;
        users.push(UserRecord { identity: identity.to_string(), digest: verifier.digest, salt: verifier.salt });
        self.write_records(MetadataKind::Users, &users)?;
        info!("Provisioned user {}", identity);
        Ok(AuthOutcome::NewUser)
    }

    /// Append a user record. Returns `false` if the identity already exists.
    pub fn append_user(&self, identity: &str, password: &str) -> Result<bool, StoreError> {
        validate_identity(identity)?;
        self.verify_all()?;

        let _guard = self.lock(MetadataKind::Users);
        let mut users: Vec<UserRecord> = self.read_records(MetadataKind::Users)?;
        if users.iter().any(|u| u.identity == identity) {
            return Ok(false);
        }
        let verifier = PasswordVerifier::create(password, &self.params)?;
        users.push(UserRecord { identity: identity.to_string(), digest: verifier.digest, salt: verifier.salt });
        self.write_records(MetadataKind::Users, &users)?;
        debug!("Appended user {}", identity);
        Ok(true)
    }

    // ── Workspaces ──

    pub fn workspace(&self, name: &str) -> Result<Option<WorkspaceRecord>, StoreError> {
        self.verify_all()?;
        self.find_workspace(name)
    }

    pub fn is_owner(&self, identity: &str, workspace: &str) -> Result<Access, StoreError> {
        self.verify_all()?;
        Ok(match self.find_workspace(workspace)? {
            None => Access::NoWorkspace,
            Some(ws) if ws.is_owner(identity) => Access::Granted,
            Some(_) => Access::NoPermission,
        })
    }

    pub fn is_member(&self, identity: &str, workspace: &str) -> Result<Access, StoreError> {
        self.verify_all()?;
        Ok(match self.find_workspace(workspace)? {
            None => Access::NoWorkspace,
            Some(ws) if ws.is_member(identity) => Access::Granted,
            Some(_) => Access::NoPermission,
        })
    }

    /// Names of every workspace `identity` belongs to, sorted.
    pub fn member_workspaces(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        self.verify_all()?;
        let _guard = self.lock(MetadataKind::Workspaces);
        let records: Vec<WorkspaceRecord> = self.read_records(MetadataKind::Workspaces)?;
        let mut names: Vec<String> = records
            .into_iter()
            .filter(|ws| ws.is_member(identity))
            .map(|ws| ws.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Append a workspace owned by `owner`. Returns `false` if the name is taken.
    pub fn append_workspace(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        validate_workspace_name(name)?;
        validate_identity(owner)?;
        self.verify_all()?;

        let _guard = self.lock(MetadataKind::Workspaces);
        let mut records: Vec<WorkspaceRecord> = self.read_records(MetadataKind::Workspaces)?;
        if records.iter().any(|ws| ws.name == name) {
            return Ok(false);
        }
        records.push(WorkspaceRecord::new(name, owner));
        self.write_records(MetadataKind::Workspaces, &records)?;
        info!("Created workspace {} owned by {}", name, owner);
        Ok(true)
    }

    /// Add `identity` to a workspace's members. Idempotent: returns `false`
    /// and leaves the file untouched if already a member.
    pub fn add_member_to_workspace(&self, workspace: &str, identity: &str) -> Result<bool, StoreError> {
        validate_identity(identity)?;
        self.verify_all()?;

        let _guard = self.lock(MetadataKind::Workspaces);
        let mut records: Vec<WorkspaceRecord> = self.read_records(MetadataKind::Workspaces)?;
        let record = records
            .iter_mut()
            .find(|ws| ws.name == workspace)
            .ok_or_else(|| StoreError::NoSuchWorkspace(workspace.to_string()))?;
        if !record.add_member(identity) {
            return Ok(false);
        }
        self.write_records(MetadataKind::Workspaces, &records)?;
        info!("Added {} to workspace {}", identity, workspace);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: KdfParams = KdfParams::for_tests();

    fn enforcing(dir: &Path) -> MetadataStore {
        let (guard, _) = IntegrityGuard::open(dir, "admin", &PARAMS, || true).unwrap();
        MetadataStore::open(dir, guard, PARAMS).unwrap()
    }

    #[test]
    fn first_login_provisions_then_checks_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());

        assert!(!store.user_exists("alice").unwrap());
        assert_eq!(store.authenticate_or_create("alice", "pw").unwrap(), AuthOutcome::NewUser);
        assert!(store.user_exists("alice").unwrap());
        assert_eq!(store.authenticate_or_create("alice", "nope").unwrap(), AuthOutcome::WrongPassword);
        assert_eq!(store.authenticate_or_create("alice", "pw").unwrap(), AuthOutcome::Authenticated);
    }

    #[test]
    fn users_log_in_after_kdf_cost_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        assert_eq!(store.authenticate_or_create("alice", "pw").unwrap(), AuthOutcome::NewUser);
        drop(store);

        let stronger = KdfParams { memory_kib: 128, iterations: 2, parallelism: 1 };
        let (guard, _) = IntegrityGuard::open(dir.path(), "admin", &stronger, || true).unwrap();
        let store = MetadataStore::open(dir.path(), guard, stronger).unwrap();
        assert_eq!(store.authenticate_or_create("alice", "pw").unwrap(), AuthOutcome::Authenticated);
        assert_eq!(store.authenticate_or_create("alice", "nope").unwrap(), AuthOutcome::WrongPassword);
        assert_eq!(store.authenticate_or_create("bob", "pw").unwrap(), AuthOutcome::NewUser);
    }

    #[test]
    fn append_user_refuses_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        assert!(store.append_user("bob", "pw").unwrap());
        assert!(!store.append_user("bob", "other").unwrap());
        assert_eq!(store.authenticate_or_create("bob", "pw").unwrap(), AuthOutcome::Authenticated);
    }

    #[test]
    fn access_checks_are_structured() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        store.append_workspace("reports", "alice").unwrap();

        assert_eq!(store.is_owner("alice", "reports").unwrap(), Access::Granted);
        assert_eq!(store.is_owner("bob", "reports").unwrap(), Access::NoPermission);
        assert_eq!(store.is_member("bob", "reports").unwrap(), Access::NoPermission);
        assert_eq!(store.is_member("bob", "nothing").unwrap(), Access::NoWorkspace);
        assert_eq!(Status::from(Access::NoWorkspace), Status::NoWorkspace);
    }

    #[test]
    fn membership_only_grows() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        assert!(store.append_workspace("reports", "alice").unwrap());
        assert!(!store.append_workspace("reports", "bob").unwrap());

        assert!(store.add_member_to_workspace("reports", "bob").unwrap());
        let before = fs::read(dir.path().join("workspaces.txt")).unwrap();
        assert!(!store.add_member_to_workspace("reports", "bob").unwrap());
        let after = fs::read(dir.path().join("workspaces.txt")).unwrap();
        assert_eq!(before, after);

        let ws = store.workspace("reports").unwrap().unwrap();
        assert_eq!(ws.members, vec!["alice", "bob"]);
        assert_eq!(ws.owner, "alice");
        assert_eq!(store.member_workspaces("bob").unwrap(), vec!["reports"]);
        assert!(matches!(
            store.add_member_to_workspace("missing", "bob"),
            Err(StoreError::NoSuchWorkspace(_))
        ));
    }

    #[test]
    fn member_workspaces_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        store.append_workspace("zeta", "alice").unwrap();
        store.append_workspace("alpha", "alice").unwrap();
        store.append_workspace("other", "bob").unwrap();
        assert_eq!(store.member_workspaces("alice").unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn tampering_stops_every_operation() {
        let dir = tempfile::tempdir().unwrap();
        let store = enforcing(dir.path());
        store.append_workspace("reports", "alice").unwrap();

        fs::write(dir.path().join("workspaces.txt"), "reports:alice:alice,mallory\n").unwrap();

        let err = store.is_member("mallory", "reports").unwrap_err();
        assert!(err.is_fatal());
        // Users file is intact, yet nothing proceeds after the violation.
        assert!(store.user_exists("alice").unwrap_err().is_fatal());
        assert!(store.append_user("carol", "pw").unwrap_err().is_fatal());
        let users = fs::read_to_string(dir.path().join("users.txt")).unwrap();
        assert!(!users.contains("carol"));
    }

    #[test]
    fn disabled_mode_ignores_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path(), IntegrityGuard::disabled(dir.path()), PARAMS).unwrap();
        store.append_workspace("reports", "alice").unwrap();
        fs::write(dir.path().join("workspaces.txt"), "reports:alice:alice,mallory\n").unwrap();
        assert_eq!(store.is_member("mallory", "reports").unwrap(), Access::Granted);
    }

    #[test]
    fn concurrent_mutations_never_trip_the_guard() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(enforcing(dir.path()));
        store.append_workspace("shared", "owner").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.add_member_to_workspace("shared", &format!("user{t}x{i}")).unwrap();
                        store.append_user(&format!("user{t}x{i}"), "pw").unwrap();
                        store.is_member("owner", "shared").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.workspace("shared").unwrap().unwrap().members.len(), 41);
        assert!(!store.integrity().is_tripped());
    }
}
