use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use sharebox_crypto::{
    CryptoError, ENVELOPE_SIZE, KeyProvider, KeyStoreError, PublicKey, create_envelope, derive_workspace_key,
};
use sharebox_store::storage::MAX_SIGNATURE_SIZE;
use sharebox_store::{Access, AuthOutcome, MetadataStore, StoreError, WorkspaceStorage};
use sharebox_transfer::{FramedChannel, TransferError};
use sharebox_types::api::format_listing;
use sharebox_types::models::{
    PERSONAL_WORKSPACE_PREFIX, personal_workspace, validate_file_name, validate_identity, validate_workspace_name,
};
use sharebox_types::{AuthStatus, Command, FileOutcome, FileStatus, ParseError, Status, UploadMarker};
use tracing::{debug, info, warn};

/// Largest envelope frame accepted during ADD.
const MAX_ENVELOPE_FRAME: usize = 1024;

/// Everything a session needs from the server.
pub struct AppState {
    pub metadata: MetadataStore,
    pub storage: WorkspaceStorage,
    pub keys: Arc<dyn KeyProvider>,
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub buffer_size: usize,
    pub socket_timeout: Option<Duration>,
    pub max_auth_attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Keys(#[from] KeyStoreError),
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),
}

impl SessionError {
    /// Errors that must stop the whole server, not just this connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_fatal())
    }
}

/// One client connection, from handshake to disconnect.
pub struct Session<S> {
    channel: FramedChannel<S>,
    state: Arc<AppState>,
    options: ConnectionOptions,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, peer: impl Into<String>, state: Arc<AppState>, options: ConnectionOptions) -> Self {
        let channel = FramedChannel::new(stream)
            .with_buffer_size(options.buffer_size)
            .with_peer(peer);
        Self { channel, state, options }
    }

    /// Serve the connection until the client leaves or an error ends it.
    pub fn run(mut self) -> Result<(), SessionError> {
        let Some(identity) = self.handshake()? else {
            return Ok(());
        };

        loop {
            let line = match self.channel.receive_message() {
                Ok(line) => line,
                Err(TransferError::Disconnected) => {
                    info!("{} disconnected", identity);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let command = Command::parse(&line)?;
            debug!(command = command.name(), "Dispatching for {}", identity);
            self.dispatch(&identity, command)?;
        }
    }

    fn receive_or_disconnect(&mut self) -> Result<Option<String>, SessionError> {
        match self.channel.receive_message() {
            Ok(message) => Ok(Some(message)),
            Err(TransferError::Disconnected) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Handshake ──

    /// Identity, then passwords until one is accepted. Returns the
    /// authenticated identity, or `None` if the connection should close.
    fn handshake(&mut self) -> Result<Option<String>, SessionError> {
        let Some(identity) = self.receive_or_disconnect()? else {
            return Ok(None);
        };
        let mut failures = 0u32;

        loop {
            let Some(password) = self.receive_or_disconnect()? else {
                debug!("{} left during authentication", identity);
                return Ok(None);
            };

            let mut status = self.authenticate(&identity, &password)?;
            if status == AuthStatus::WrongPassword {
                failures += 1;
                if self.options.max_auth_attempts.is_some_and(|max| failures >= max) {
                    warn!("{} exceeded {} password attempts", identity, failures);
                    status = AuthStatus::Rejected;
                }
            }
            self.channel.send_message(status.as_str())?;

            match status {
                AuthStatus::NewUser | AuthStatus::Authenticated => {
                    info!("{} authenticated ({})", identity, status);
                    return Ok(Some(identity));
                }
                AuthStatus::WrongPassword => debug!("Wrong password for {}", identity),
                AuthStatus::Rejected => return Ok(None),
            }
        }
    }

    fn authenticate(&self, identity: &str, password: &str) -> Result<AuthStatus, SessionError> {
        if validate_identity(identity).is_err()
            || validate_workspace_name(&personal_workspace(identity)).is_err()
            || password.is_empty()
        {
            warn!("Rejected malformed identity or empty password");
            return Ok(AuthStatus::Rejected);
        }

        let metadata = &self.state.metadata;
        // An unknown identity is only provisioned if its public key is on file.
        let new_key = if metadata.user_exists(identity)? {
            None
        } else {
            match self.state.keys.public_key_of(identity) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Refusing to provision {}: {}", identity, e);
                    return Ok(AuthStatus::Rejected);
                }
            }
        };

        match metadata.authenticate_or_create(identity, password)? {
            AuthOutcome::Authenticated => Ok(AuthStatus::Authenticated),
            AuthOutcome::WrongPassword => Ok(AuthStatus::WrongPassword),
            AuthOutcome::NewUser => {
                let key = match new_key {
                    Some(key) => key,
                    None => self.state.keys.public_key_of(identity)?,
                };
                self.provision_personal_workspace(identity, password, &key)?;
                Ok(AuthStatus::NewUser)
            }
        }
    }

    fn provision_personal_workspace(&self, identity: &str, password: &str, key: &PublicKey) -> Result<(), SessionError> {
        let workspace = personal_workspace(identity);
        if !self.state.metadata.append_workspace(&workspace, identity)? {
            warn!("Personal workspace {} already exists", workspace);
            return Ok(());
        }
        self.install_owner_envelope(&workspace, identity, password, key)
    }

    fn install_owner_envelope(
        &self,
        workspace: &str,
        owner: &str,
        password: &str,
        key: &PublicKey,
    ) -> Result<(), SessionError> {
        self.state.storage.create_workspace(workspace)?;
        let workspace_key = derive_workspace_key(password, workspace, self.state.metadata.kdf_params())?;
        let envelope = create_envelope(&workspace_key, key)?;
        self.state.storage.write_envelope(workspace, owner, &envelope)?;
        Ok(())
    }

    // ── Commands ──

    fn dispatch(&mut self, identity: &str, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Create { workspace, password } => self.create(identity, &workspace, &password),
            Command::Add { user, workspace } => self.add(identity, &user, &workspace),
            Command::Upload { workspace, files } => self.upload(identity, &workspace, &files),
            Command::Download { workspace, files } => self.download(identity, &workspace, &files),
            Command::Remove { workspace, files } => self.remove(identity, &workspace, &files),
            Command::ListWorkspaces => self.list_workspaces(identity),
            Command::ListFiles { workspace } => self.list_files(identity, &workspace),
        }
    }

    fn create(&mut self, identity: &str, workspace: &str, password: &str) -> Result<(), SessionError> {
        let status = self.try_create(identity, workspace, password)?;
        self.channel.send_message(status.as_str())?;
        Ok(())
    }

    fn try_create(&self, identity: &str, workspace: &str, password: &str) -> Result<Status, SessionError> {
        if validate_workspace_name(workspace).is_err() || workspace.contains(PERSONAL_WORKSPACE_PREFIX) {
            debug!("Refused workspace name {:?}", workspace);
            return Ok(Status::Nok);
        }
        let key = match self.state.keys.public_key_of(identity) {
            Ok(key) => key,
            Err(e) => {
                warn!("No public key for {}: {}", identity, e);
                return Ok(Status::Nok);
            }
        };
        if !self.state.metadata.append_workspace(workspace, identity)? {
            return Ok(Status::Nok);
        }
        self.install_owner_envelope(workspace, identity, password, &key)?;
        Ok(Status::Ok)
    }

    /// ADD: the owner's client unwraps the current envelope and re-wraps the
    /// key for the new member, since only it holds a private key. An existing
    /// member keeps the envelope it was given when it joined.
    fn add(&mut self, identity: &str, user: &str, workspace: &str) -> Result<(), SessionError> {
        let metadata = &self.state.metadata;
        let mut status = if validate_identity(user).is_err() || !metadata.user_exists(user)? {
            Status::NoUser
        } else {
            metadata.is_owner(identity, workspace)?.into()
        };
        let already_member = status.is_ok() && metadata.is_member(user, workspace)? == Access::Granted;
        let current = match status {
            Status::Ok if !already_member => self.state.storage.read_envelope(workspace, identity)?,
            _ => None,
        };
        if status.is_ok() && !already_member && current.is_none() {
            warn!("{} owns {} but has no envelope", identity, workspace);
            status = Status::Nok;
        }
        self.channel.send_message(status.as_str())?;
        if already_member {
            // An empty frame in place of the owner's envelope: nothing to wrap.
            debug!("{} is already a member of {}", user, workspace);
            self.channel.send_bytes(&[])?;
            return Ok(());
        }
        let Some(current) = current else {
            return Ok(());
        };

        self.channel.send_bytes(&current)?;
        let wrapped = self.channel.receive_bytes(MAX_ENVELOPE_FRAME)?;
        let outcome = if wrapped.is_empty() {
            debug!("Client aborted ADD {} {}", user, workspace);
            Status::Nok
        } else if wrapped.len() != ENVELOPE_SIZE {
            warn!("Envelope for {} has {} bytes", user, wrapped.len());
            Status::Nok
        } else if self.state.metadata.is_member(user, workspace)? == Access::Granted {
            // Joined through a concurrent ADD; that envelope stays.
            Status::Ok
        } else {
            // Envelope first: a member without an envelope could not read anything.
            self.state.storage.write_envelope(workspace, user, &wrapped)?;
            self.state.metadata.add_member_to_workspace(workspace, user)?;
            Status::Ok
        };
        self.channel.send_message(outcome.as_str())?;
        Ok(())
    }

    /// Send the membership status and, when granted, the caller's envelope.
    fn open_workspace(&mut self, identity: &str, workspace: &str) -> Result<bool, SessionError> {
        let mut status: Status = self.state.metadata.is_member(identity, workspace)?.into();
        let envelope = match status {
            Status::Ok => self.state.storage.read_envelope(workspace, identity)?,
            _ => None,
        };
        if status.is_ok() && envelope.is_none() {
            warn!("{} is a member of {} but has no envelope", identity, workspace);
            status = Status::Nok;
        }
        self.channel.send_message(status.as_str())?;
        match envelope {
            Some(envelope) => {
                self.channel.send_bytes(&envelope)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn upload(&mut self, identity: &str, workspace: &str, files: &[String]) -> Result<(), SessionError> {
        if !self.open_workspace(identity, workspace)? {
            return Ok(());
        }
        for name in files {
            let status = self.receive_upload(identity, workspace, name)?;
            self.channel.send_message(&status.to_string())?;
        }
        Ok(())
    }

    fn receive_upload(&mut self, identity: &str, workspace: &str, name: &str) -> Result<FileStatus, SessionError> {
        let marker: UploadMarker = self.channel.receive_message()?.parse()?;
        if let UploadMarker::Skip(reason) = marker {
            debug!("Client skipped {}: {}", name, reason);
            let reason = if reason.is_empty() { "skipped".to_string() } else { reason };
            return Ok(FileStatus::failed(name, reason));
        }

        let staged = match validate_file_name(name) {
            Ok(()) => recoverable(self.state.storage.stage(workspace))?,
            Err(e) => {
                debug!("Refused file name {:?}: {}", name, e);
                Err("invalid name".to_string())
            }
        };
        let mut staged = match staged {
            Ok(staged) => staged,
            Err(reason) => {
                self.channel.discard_payload()?;
                self.channel.discard_payload()?;
                return Ok(FileStatus::failed(name, reason));
            }
        };

        if let Err(e) = self.channel.receive_into_or_drain(staged.as_file_mut())? {
            warn!("Staging {} in {} failed: {}", name, workspace, e);
            self.channel.discard_payload()?;
            return Ok(FileStatus::failed(name, "server error"));
        }
        let signature = self.channel.receive_bytes(MAX_SIGNATURE_SIZE)?;
        let committed = self.state.storage.commit_upload(workspace, name, identity, staged, &signature);
        Ok(match recoverable(committed)? {
            Ok(()) => FileStatus::new(name, FileOutcome::Ok),
            Err(reason) => FileStatus::failed(name, reason),
        })
    }

    fn download(&mut self, identity: &str, workspace: &str, files: &[String]) -> Result<(), SessionError> {
        if !self.open_workspace(identity, workspace)? {
            return Ok(());
        }
        for name in files {
            match recoverable(self.state.storage.open_file(workspace, name))? {
                Ok(Some(stored)) => {
                    self.channel.send_message(&FileStatus::new(name, FileOutcome::Ok).to_string())?;
                    self.channel.send_message(&stored.signer)?;
                    self.channel.send_bytes(&stored.signature)?;
                    self.channel.send_reader(stored.ciphertext, stored.len)?;
                    debug!("Sent {} from {}", name, workspace);
                }
                Ok(None) => {
                    self.channel.send_message(&FileStatus::new(name, FileOutcome::NotFound).to_string())?;
                }
                Err(reason) => {
                    self.channel.send_message(&FileStatus::failed(name, reason).to_string())?;
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, identity: &str, workspace: &str, files: &[String]) -> Result<(), SessionError> {
        let status: Status = self.state.metadata.is_member(identity, workspace)?.into();
        self.channel.send_message(status.as_str())?;
        if !status.is_ok() {
            return Ok(());
        }
        for name in files {
            let status = match recoverable(self.state.storage.remove_file(workspace, name))? {
                Ok(true) => FileStatus::new(name, FileOutcome::Deleted),
                Ok(false) => FileStatus::new(name, FileOutcome::NotFound),
                Err(reason) => FileStatus::failed(name, reason),
            };
            self.channel.send_message(&status.to_string())?;
        }
        Ok(())
    }

    fn list_workspaces(&mut self, identity: &str) -> Result<(), SessionError> {
        let names = self.state.metadata.member_workspaces(identity)?;
        self.channel.send_message(&format_listing(&names))?;
        Ok(())
    }

    fn list_files(&mut self, identity: &str, workspace: &str) -> Result<(), SessionError> {
        let status: Status = self.state.metadata.is_member(identity, workspace)?.into();
        let listing = match status {
            Status::Ok => Some(format_listing(&self.state.storage.list_files(workspace)?)),
            _ => None,
        };
        self.channel.send_message(status.as_str())?;
        if let Some(listing) = listing {
            self.channel.send_message(&listing)?;
        }
        Ok(())
    }
}

/// Turn a per-file store failure into a status reason. Fatal errors still
/// end the session.
fn recoverable<T>(result: Result<T, StoreError>) -> Result<Result<T, String>, SessionError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("Per-file failure: {}", e);
            let reason = match e {
                StoreError::InvalidName(_) => "invalid name",
                StoreError::MissingSignature(_) => "missing signature",
                _ => "server error",
            };
            Ok(Err(reason.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use sharebox_types::NameError;

    use super::*;

    #[test]
    fn only_integrity_violations_are_fatal() {
        let fatal = SessionError::from(StoreError::IntegrityViolation { file: "users.txt" });
        assert!(fatal.is_fatal());
        assert!(!SessionError::from(TransferError::Disconnected).is_fatal());
        assert!(!SessionError::from(StoreError::MissingSignature("a".into())).is_fatal());
    }

    #[test]
    fn per_file_failures_get_short_reasons() {
        let invalid: Result<(), _> = Err(StoreError::InvalidName(NameError::Hidden));
        assert_eq!(recoverable(invalid).unwrap(), Err("invalid name".to_string()));

        let io: Result<(), _> = Err(StoreError::Io(std::io::Error::other("disk on fire")));
        assert_eq!(recoverable(io).unwrap(), Err("server error".to_string()));

        let violation: Result<(), _> = Err(StoreError::IntegrityViolation { file: "workspaces.txt" });
        assert!(recoverable(violation).unwrap_err().is_fatal());
    }
}
