/// sharebox server-side persistence.
///
/// Data directory layout:
///
/// ```text
/// users.txt          identity:saltedDigest:salt
/// workspaces.txt     name:owner:member1,member2
/// users.mac          base64 HMAC-SHA-256 of users.txt
/// workspaces.mac     base64 HMAC-SHA-256 of workspaces.txt
/// integrity.salt     base64 KDF salt for the MAC key
/// integrity.params   Argon2 cost of the MAC key, `m=..,t=..,p=..`
/// workspaces/<ws>/   ciphertext, <file>.signed.<signer>, <ws>.key.<member>
/// ```
///
/// Metadata files are rewritten whole, through a temp file and an atomic
/// rename. The integrity guard re-verifies them before every access.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub mod error;
pub mod integrity;
pub mod metadata;
pub mod storage;

pub use error::StoreError;
pub use integrity::{IntegrityGuard, IntegrityMode, IntegrityStartup, MetadataKind};
pub use metadata::{Access, AuthOutcome, MetadataStore};
pub use storage::{StoredFile, SweepReport, WorkspaceStorage};

/// Directory holding workspace trees, under the data directory.
pub const WORKSPACES_DIR: &str = "workspaces";

/// Replace `path` with `data` so readers see either the old or the new content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new().prefix(".staging-").tempfile_in(dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a file, treating a missing one as empty.
pub(crate) fn read_or_empty(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
