use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use sharebox_types::models::{
    ENVELOPE_INFIX, SIGNATURE_INFIX, validate_file_name, validate_identity, validate_workspace_name,
};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::write_atomic;

/// Prefix of in-flight files inside a workspace directory.
const STAGING_PREFIX: &str = ".staging-";

/// Upper bound on a stored signature blob.
pub const MAX_SIGNATURE_SIZE: usize = 4096;

/// A stored file opened for download.
///
/// The signature and ciphertext were opened together under the content
/// lock, so they belong to the same upload even if a new version lands
/// while the caller streams them.
pub struct StoredFile {
    pub signer: String,
    pub signature: Vec<u8>,
    pub ciphertext: File,
    pub len: u64,
}

/// Files removed by a startup sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub staging: usize,
    pub orphaned_signatures: usize,
}

/// Manages the on-disk workspace trees.
///
/// Each workspace is a directory `{root}/{workspace}` holding ciphertext
/// files, one `<file>.signed.<signer>` per file and one
/// `<workspace>.key.<member>` envelope per member. One lock covers all
/// content changes; it is never held while talking to a client.
pub struct WorkspaceStorage {
    root: PathBuf,
    content: Mutex<()>,
}

impl WorkspaceStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("Workspace storage directory: {}", root.display());
        Ok(Self { root, content: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a workspace directory.
    pub fn workspace_dir(&self, workspace: &str) -> Result<PathBuf, StoreError> {
        validate_workspace_name(workspace)?;
        Ok(self.root.join(workspace))
    }

    fn file_path(&self, workspace: &str, name: &str) -> Result<PathBuf, StoreError> {
        validate_file_name(name)?;
        Ok(self.workspace_dir(workspace)?.join(name))
    }

    fn signature_prefix(name: &str) -> String {
        format!("{name}{SIGNATURE_INFIX}")
    }

    /// Create the directory for a new workspace. Returns `false` if it exists.
    pub fn create_workspace(&self, workspace: &str) -> Result<bool, StoreError> {
        let dir = self.workspace_dir(workspace)?;
        match fs::create_dir(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn workspace_exists(&self, workspace: &str) -> bool {
        self.workspace_dir(workspace).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    // ── Envelopes ──

    fn envelope_path(&self, workspace: &str, identity: &str) -> Result<PathBuf, StoreError> {
        validate_identity(identity)?;
        Ok(self.workspace_dir(workspace)?.join(format!("{workspace}{ENVELOPE_INFIX}{identity}")))
    }

    pub fn write_envelope(&self, workspace: &str, identity: &str, envelope: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.envelope_path(workspace, identity)?, envelope)?;
        debug!("Stored envelope for {} in {}", identity, workspace);
        Ok(())
    }

    pub fn read_envelope(&self, workspace: &str, identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.envelope_path(workspace, identity)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── File content ──

    /// A temporary file inside the workspace directory for an incoming upload.
    pub fn stage(&self, workspace: &str) -> Result<NamedTempFile, StoreError> {
        let dir = self.workspace_dir(workspace)?;
        Ok(tempfile::Builder::new().prefix(STAGING_PREFIX).tempfile_in(dir)?)
    }

    /// Signature files of `name` as (signer, path).
    fn signatures_of(&self, dir: &Path, name: &str) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let prefix = Self::signature_prefix(name);
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some(signer) = file_name.strip_prefix(&prefix) {
                if validate_identity(signer).is_ok() {
                    found.push((signer.to_string(), entry.path()));
                }
            }
        }
        Ok(found)
    }

    /// Install a fully received upload as the current version of `name`.
    ///
    /// Both parts are staged and synced first. Under the content lock the
    /// new ciphertext and the new signature are renamed into place, and only
    /// then are signatures from other signers removed. A crash at any point
    /// leaves either the old pair, or a state that fails verification on
    /// download. It never silently pairs old content with a new signature.
    pub fn commit_upload(
        &self,
        workspace: &str,
        name: &str,
        uploader: &str,
        ciphertext: NamedTempFile,
        signature: &[u8],
    ) -> Result<(), StoreError> {
        validate_identity(uploader)?;
        let target = self.file_path(workspace, name)?;
        let dir = self.workspace_dir(workspace)?;
        let signature_path = dir.join(format!("{}{uploader}", Self::signature_prefix(name)));

        let mut staged_signature = self.stage(workspace)?;
        staged_signature.write_all(signature)?;
        staged_signature.as_file().sync_all()?;
        ciphertext.as_file().sync_all()?;

        let _guard = self.content.lock();
        ciphertext.persist(&target)?;
        staged_signature.persist(&signature_path)?;
        for (signer, stale) in self.signatures_of(&dir, name)? {
            if signer != uploader {
                remove_if_present(&stale)?;
            }
        }
        info!("Stored {} in {} (signed by {})", name, workspace, uploader);
        Ok(())
    }

    /// Open a stored file and its signature. `None` if the file is absent.
    pub fn open_file(&self, workspace: &str, name: &str) -> Result<Option<StoredFile>, StoreError> {
        let target = self.file_path(workspace, name)?;
        let dir = self.workspace_dir(workspace)?;

        let _guard = self.content.lock();
        let ciphertext = match File::open(&target) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = ciphertext.metadata()?.len();

        // Several signatures only exist after an interrupted commit; the
        // newest belongs to the newest ciphertext.
        let mut newest: Option<(SystemTime, String, PathBuf)> = None;
        for (signer, path) in self.signatures_of(&dir, name)? {
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().is_none_or(|(t, _, _)| modified > *t) {
                newest = Some((modified, signer, path));
            }
        }
        let Some((_, signer, path)) = newest else {
            return Err(StoreError::MissingSignature(name.to_string()));
        };
        let signature = fs::read(&path)?;
        if signature.len() > MAX_SIGNATURE_SIZE {
            return Err(StoreError::MissingSignature(name.to_string()));
        }

        Ok(Some(StoredFile { signer, signature, ciphertext, len }))
    }

    /// Delete a file and all its signatures. Returns `false` if the file was absent.
    pub fn remove_file(&self, workspace: &str, name: &str) -> Result<bool, StoreError> {
        let target = self.file_path(workspace, name)?;
        let dir = self.workspace_dir(workspace)?;

        let _guard = self.content.lock();
        let existed = remove_if_present(&target)?;
        for (_, signature) in self.signatures_of(&dir, name)? {
            remove_if_present(&signature)?;
        }
        if existed {
            info!("Deleted {} from {}", name, workspace);
        }
        Ok(existed)
    }

    /// User-visible files in a workspace, sorted. Envelopes, signatures and
    /// staging files are not listed.
    pub fn list_files(&self, workspace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.workspace_dir(workspace)?;
        let _guard = self.content.lock();
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_file_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove leftovers of interrupted transfers: staging files, and
    /// signatures whose ciphertext is gone.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let _guard = self.content.lock();
        let mut report = SweepReport::default();

        for workspace in fs::read_dir(&self.root)? {
            let workspace = workspace?;
            if !workspace.file_type()?.is_dir() {
                continue;
            }
            let dir = workspace.path();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else { continue };

                if file_name.starts_with(STAGING_PREFIX) || file_name.starts_with(".incoming-") {
                    remove_if_present(&entry.path())?;
                    report.staging += 1;
                } else if let Some((name, _signer)) = file_name.split_once(SIGNATURE_INFIX) {
                    if !dir.join(name).exists() {
                        remove_if_present(&entry.path())?;
                        report.orphaned_signatures += 1;
                    }
                }
            }
        }

        if report != SweepReport::default() {
            warn!(
                "Startup sweep removed {} staging files and {} orphaned signatures",
                report.staging, report.orphaned_signatures
            );
        }
        Ok(report)
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
