/// sharebox client library.
///
/// Holds the caller's identity key and does all plaintext work locally:
/// envelopes are opened and re-wrapped here, files are signed and encrypted
/// before upload, and decrypted and verified after download. The server only
/// ever sees ciphertext.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use sharebox_crypto::{KeyProvider, SecretKey, WorkspaceKey, create_envelope, open_envelope};
use sharebox_transfer::FramedChannel;
use sharebox_types::api::parse_listing;
use sharebox_types::models::validate_file_name;
use sharebox_types::{AuthStatus, Command, FileOutcome, FileStatus, Status};
use socket2::SockRef;
use tracing::{debug, info, warn};

pub mod download;
pub mod error;
pub mod upload;

pub use error::ClientError;

/// Largest envelope frame the client accepts.
const MAX_ENVELOPE_FRAME: usize = 1024;

/// Outcome for one file of an UP, DW or RM batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResult {
    /// The server's per-file status.
    Remote(FileOutcome),
    /// Decrypted and verified; written to `path`.
    Downloaded { signer: String, path: PathBuf },
    /// Decryption or signature verification failed. The plaintext was
    /// discarded; the signature artifact was kept.
    Corrupted { signer: String },
    /// Failed on this side, before or after the transfer.
    Local(String),
}

impl FileResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Remote(FileOutcome::Ok | FileOutcome::Deleted) | Self::Downloaded { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Command-level status. `Nok` without a round trip when no file name
    /// was valid locally.
    pub status: Status,
    pub files: Vec<(String, FileResult)>,
}

impl BatchReport {
    pub fn result(&self, name: &str) -> Option<&FileResult> {
        self.files.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }
}

/// Split requested names into ones that can go on the wire and local failures.
pub(crate) fn partition_names<N: AsRef<str>>(names: &[N]) -> (Vec<String>, Vec<(String, FileResult)>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for name in names {
        let name = name.as_ref();
        match validate_file_name(name) {
            Ok(()) => valid.push(name.to_string()),
            Err(e) => invalid.push((name.to_string(), FileResult::Local(e.to_string()))),
        }
    }
    (valid, invalid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Fresh,
    IdentitySent,
    Authenticated,
}

pub struct Client<S> {
    channel: FramedChannel<S>,
    identity: String,
    secret: SecretKey,
    keys: Arc<dyn KeyProvider>,
    auth: AuthState,
}

impl Client<TcpStream> {
    pub fn connect(
        addr: impl ToSocketAddrs,
        identity: &str,
        secret: SecretKey,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        SockRef::from(&stream).set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Ok(Self::new(stream, identity, secret, keys).with_peer(peer))
    }
}

impl<S: Read + Write> Client<S> {
    pub fn new(stream: S, identity: &str, secret: SecretKey, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            channel: FramedChannel::new(stream),
            identity: identity.to_string(),
            secret,
            keys,
            auth: AuthState::Fresh,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.channel = self.channel.with_buffer_size(size);
        self
    }

    fn with_peer(mut self, peer: String) -> Self {
        self.channel = self.channel.with_peer(peer);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    /// Send a password. The identity goes out on the first call only, so
    /// after `WrongPassword` this can simply be called again.
    pub fn authenticate(&mut self, password: &str) -> Result<AuthStatus, ClientError> {
        if self.auth == AuthState::Fresh {
            self.channel.send_message(&self.identity)?;
            self.auth = AuthState::IdentitySent;
        }
        self.channel.send_message(password)?;
        let status: AuthStatus = self.channel.receive_message()?.parse()?;
        if status.is_authenticated() {
            info!("Logged in as {} ({})", self.identity, status);
            self.auth = AuthState::Authenticated;
        }
        Ok(status)
    }

    fn require_auth(&self) -> Result<(), ClientError> {
        match self.auth {
            AuthState::Authenticated => Ok(()),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    fn receive_status(&mut self) -> Result<Status, ClientError> {
        Ok(self.channel.receive_message()?.parse()?)
    }

    /// Send a command and read its status line.
    fn request(&mut self, command: &Command) -> Result<Status, ClientError> {
        self.require_auth()?;
        debug!(command = command.name(), "Sending");
        self.channel.send_message(&command.to_string())?;
        self.receive_status()
    }

    /// Receive this identity's envelope and try to open it. The frame is
    /// always consumed; a key that cannot be opened is reported as `None`.
    fn receive_workspace_key(&mut self, workspace: &str) -> Result<Option<WorkspaceKey>, ClientError> {
        let envelope = self.channel.receive_bytes(MAX_ENVELOPE_FRAME)?;
        match open_envelope(&envelope, &self.secret) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!("Cannot open envelope for {}: {}", workspace, e);
                Ok(None)
            }
        }
    }

    pub fn create_workspace(&mut self, workspace: &str, password: &str) -> Result<Status, ClientError> {
        self.request(&Command::Create { workspace: workspace.to_string(), password: password.to_string() })
    }

    /// Give `user` access to `workspace`. The workspace key is unwrapped with
    /// this client's private key and re-wrapped for `user`'s public key.
    /// Adding an existing member succeeds without touching its envelope.
    pub fn add_member(&mut self, user: &str, workspace: &str) -> Result<Status, ClientError> {
        let status = self.request(&Command::Add { user: user.to_string(), workspace: workspace.to_string() })?;
        if !status.is_ok() {
            return Ok(status);
        }

        let current = self.channel.receive_bytes(MAX_ENVELOPE_FRAME)?;
        if current.is_empty() {
            debug!("{} is already a member of {}", user, workspace);
            return Ok(status);
        }
        match self.rewrap(&current, user) {
            Ok(envelope) => {
                self.channel.send_bytes(&envelope)?;
                self.receive_status()
            }
            Err(e) => {
                // An empty frame tells the server to drop the request.
                self.channel.send_bytes(&[])?;
                self.receive_status()?;
                Err(e)
            }
        }
    }

    fn rewrap(&self, current: &[u8], user: &str) -> Result<Vec<u8>, ClientError> {
        let key = open_envelope(current, &self.secret)?;
        let member = self.keys.public_key_of(user)?;
        Ok(create_envelope(&key, &member)?)
    }

    /// Delete files. Signatures go with them.
    pub fn remove<N: AsRef<str>>(&mut self, workspace: &str, names: &[N]) -> Result<BatchReport, ClientError> {
        let (files, local_failures) = partition_names(names);
        if files.is_empty() {
            return Ok(BatchReport { status: Status::Nok, files: local_failures });
        }
        let count = files.len();
        let status = self.request(&Command::Remove { workspace: workspace.to_string(), files })?;
        let mut report = BatchReport { status, files: local_failures };
        if !status.is_ok() {
            return Ok(report);
        }
        for _ in 0..count {
            let line: FileStatus = self.channel.receive_message()?.parse()?;
            report.files.push((line.name, FileResult::Remote(line.outcome)));
        }
        Ok(report)
    }

    /// Workspaces this identity belongs to.
    pub fn list_workspaces(&mut self) -> Result<Vec<String>, ClientError> {
        self.require_auth()?;
        self.channel.send_message(&Command::ListWorkspaces.to_string())?;
        Ok(parse_listing(&self.channel.receive_message()?)?)
    }

    /// Files in a workspace. The list is empty unless the status is `Ok`.
    pub fn list_files(&mut self, workspace: &str) -> Result<(Status, Vec<String>), ClientError> {
        let status = self.request(&Command::ListFiles { workspace: workspace.to_string() })?;
        if !status.is_ok() {
            return Ok((status, Vec::new()));
        }
        Ok((status, parse_listing(&self.channel.receive_message()?)?))
    }

    pub fn into_inner(self) -> S {
        self.channel.into_inner()
    }
}
