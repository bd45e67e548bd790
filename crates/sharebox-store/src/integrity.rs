/// Tamper evidence for the metadata files.
///
/// In ENFORCING mode each metadata file has an HMAC-SHA-256 tag beside it.
/// Every read re-checks the tag and every write replaces it. The first
/// mismatch latches the guard: from then on every check and every seal
/// fails, so no later mutation is observable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sharebox_crypto::keys::random_bytes;
use sharebox_crypto::{KdfParams, MacKey};
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::{read_or_empty, write_atomic};

const SALT_FILE: &str = "integrity.salt";
const PARAMS_FILE: &str = "integrity.params";
const SALT_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Users,
    Workspaces,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 2] = [MetadataKind::Users, MetadataKind::Workspaces];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Users => "users.txt",
            Self::Workspaces => "workspaces.txt",
        }
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Users => "users.mac",
            Self::Workspaces => "workspaces.mac",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityMode {
    Enforcing,
    Disabled,
}

/// How the guard came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStartup {
    /// No tags existed; fresh tags were written.
    Initialized,
    /// No tags existed and the administrator declined.
    Disabled,
    /// Existing tags matched.
    Verified,
}

pub struct IntegrityGuard {
    root: PathBuf,
    key: Option<MacKey>,
    tripped: AtomicBool,
}

impl IntegrityGuard {
    /// A guard whose checks always pass.
    pub fn disabled(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), key: None, tripped: AtomicBool::new(false) }
    }

    /// Bring the guard up at server start.
    ///
    /// `consent` is asked only when no tags exist yet. A salt left without
    /// any tag (a crash during the first start) counts as no tags. When tags
    /// exist they are verified with the key derived from `passphrase` at the
    /// KDF cost recorded at initialization; `params` only applies to a fresh
    /// initialization. A mismatch (including a wrong passphrase) is an
    /// `IntegrityViolation`.
    pub fn open(
        root: &Path,
        passphrase: &str,
        params: &KdfParams,
        consent: impl FnOnce() -> bool,
    ) -> Result<(Self, IntegrityStartup), StoreError> {
        let any_tag = MetadataKind::ALL.iter().any(|k| root.join(k.tag_name()).exists());

        if !any_tag {
            if root.join(SALT_FILE).exists() {
                warn!("Integrity salt found without tags; initializing again");
            }
            if !consent() {
                warn!("Metadata integrity checks DISABLED");
                return Ok((Self::disabled(root), IntegrityStartup::Disabled));
            }
            let salt: [u8; SALT_SIZE] = random_bytes();
            write_atomic(&root.join(PARAMS_FILE), params.to_string().as_bytes())?;
            write_atomic(&root.join(SALT_FILE), BASE64.encode(salt).as_bytes())?;
            let guard = Self {
                root: root.to_path_buf(),
                key: Some(MacKey::derive(passphrase, &salt, params)?),
                tripped: AtomicBool::new(false),
            };
            for kind in MetadataKind::ALL {
                let data = read_or_empty(&root.join(kind.file_name()))?;
                guard.seal(kind, &data)?;
            }
            info!("Metadata integrity tags initialized ({})", params);
            return Ok((guard, IntegrityStartup::Initialized));
        }

        let salt = read_setting(&root.join(SALT_FILE))?.and_then(|text| BASE64.decode(text.trim()).ok());
        let Some(salt) = salt else {
            error!("Integrity salt missing or unreadable while tags exist");
            return Err(StoreError::IntegrityViolation { file: SALT_FILE });
        };
        let stored = read_setting(&root.join(PARAMS_FILE))?.and_then(|text| text.parse::<KdfParams>().ok());
        let Some(stored) = stored else {
            error!("Integrity KDF parameters missing or unreadable while tags exist");
            return Err(StoreError::IntegrityViolation { file: PARAMS_FILE });
        };
        if stored != *params {
            info!("Integrity key uses recorded KDF cost {} (configured {})", stored, params);
        }

        let guard = Self {
            root: root.to_path_buf(),
            key: Some(MacKey::derive(passphrase, &salt, &stored)?),
            tripped: AtomicBool::new(false),
        };
        for kind in MetadataKind::ALL {
            let data = read_or_empty(&root.join(kind.file_name()))?;
            guard.check(kind, &data)?;
        }
        info!("Metadata integrity verified");
        Ok((guard, IntegrityStartup::Verified))
    }

    pub fn mode(&self) -> IntegrityMode {
        if self.key.is_some() { IntegrityMode::Enforcing } else { IntegrityMode::Disabled }
    }

    /// True once a violation has been seen.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self, kind: MetadataKind) -> StoreError {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            error!("INTEGRITY VIOLATION: {} does not match its MAC", kind.file_name());
        }
        StoreError::IntegrityViolation { file: kind.file_name() }
    }

    /// Verify `data` (the current content of `kind`) against its stored tag.
    pub fn check(&self, kind: MetadataKind, data: &[u8]) -> Result<(), StoreError> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        if self.is_tripped() {
            return Err(StoreError::IntegrityViolation { file: kind.file_name() });
        }
        let stored = read_setting(&self.root.join(kind.tag_name()))?.and_then(|text| BASE64.decode(text.trim()).ok());
        match stored {
            Some(tag) if key.verify(data, &tag) => Ok(()),
            _ => Err(self.trip(kind)),
        }
    }

    /// Replace the stored tag of `kind` after a successful write of `data`.
    pub fn seal(&self, kind: MetadataKind, data: &[u8]) -> Result<(), StoreError> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        if self.is_tripped() {
            return Err(StoreError::IntegrityViolation { file: kind.file_name() });
        }
        write_atomic(&self.root.join(kind.tag_name()), BASE64.encode(key.tag(data)).as_bytes())?;
        Ok(())
    }
}

fn read_setting(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
