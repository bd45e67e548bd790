/// Password-based key derivation (Argon2id).
///
/// One KDF serves three purposes: user password verifiers, workspace keys
/// derived from the CREATE password, and the integrity MAC key derived from
/// the administrator passphrase.

use std::fmt;
use std::str::FromStr;

use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier as _, SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const SALT_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

const WORKSPACE_SALT_LABEL: &[u8] = b"sharebox workspace key v1";

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub const fn for_tests() -> Self {
        Self { memory_kib: 64, iterations: 1, parallelism: 1 }
    }

    fn hasher(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_SIZE))
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Derive `KEY_SIZE` bytes from a password and salt.
    pub fn derive(&self, password: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        self.hasher()?
            .hash_password_into(password, salt, &mut out[..])
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(out)
    }
}

/// PHC-style parameter string, `m=<kib>,t=<iterations>,p=<lanes>`. Used
/// wherever derived keys must be re-derived later with the same cost.
impl fmt::Display for KdfParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={},t={},p={}", self.memory_kib, self.iterations, self.parallelism)
    }
}

impl FromStr for KdfParams {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CryptoError::Kdf(format!("invalid parameter string {s:?}"));
        let (mut m, mut t, mut p) = (None, None, None);
        for field in s.trim().split(',') {
            let (name, value) = field.split_once('=').ok_or_else(invalid)?;
            let value: u32 = value.parse().map_err(|_| invalid())?;
            match name {
                "m" => m = Some(value),
                "t" => t = Some(value),
                "p" => p = Some(value),
                _ => return Err(invalid()),
            }
        }
        let params = Self {
            memory_kib: m.ok_or_else(invalid)?,
            iterations: t.ok_or_else(invalid)?,
            parallelism: p.ok_or_else(invalid)?,
        };
        params.hasher()?;
        Ok(params)
    }
}

// -- Password verifiers --

/// Password verifier as stored in `users.txt`.
///
/// `digest` is the full PHC hash string, which carries the Argon2 cost
/// parameters it was made with, so verification keeps working after the
/// configured cost changes. `salt` repeats the PHC salt for the record format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordVerifier {
    pub digest: String,
    pub salt: String,
}

impl PasswordVerifier {
    /// Hash a password with a fresh random salt at the given cost.
    pub fn create(password: &str, params: &KdfParams) -> Result<Self, CryptoError> {
        let salt = SaltString::generate(&mut OsRng);
        let digest = params
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?
            .to_string();
        Ok(Self { digest, salt: salt.as_str().to_string() })
    }

    /// Check a password against the stored hash, at the cost recorded in it.
    pub fn matches(&self, password: &str) -> Result<bool, CryptoError> {
        let hash = PasswordHash::new(&self.digest).map_err(|e| CryptoError::Kdf(format!("stored hash: {e}")))?;
        if hash.salt.map(|s| s.as_str()) != Some(self.salt.as_str()) {
            return Err(CryptoError::Kdf("stored salt does not match the hash".into()));
        }
        match Argon2::default().verify_password(password.as_bytes(), &hash) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(CryptoError::Kdf(e.to_string())),
        }
    }
}

// -- Workspace keys --

/// The symmetric content key of a workspace. Never persisted in the clear.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WorkspaceKey([u8; KEY_SIZE]);

impl WorkspaceKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkspaceKey(<redacted>)")
    }
}

/// Salt for a workspace key: a labelled SHA-256 of the workspace name.
pub fn workspace_salt(workspace: &str) -> [u8; SALT_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(WORKSPACE_SALT_LABEL);
    hasher.update(workspace.as_bytes());
    let digest = hasher.finalize();
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&digest[..SALT_SIZE]);
    salt
}

/// Derive a workspace key from its creation password.
///
/// The same password and name always give the same key, so the key can be
/// recovered from the shared passphrase alone.
pub fn derive_workspace_key(
    password: &str,
    workspace: &str,
    params: &KdfParams,
) -> Result<WorkspaceKey, CryptoError> {
    let derived = params.derive(password.as_bytes(), &workspace_salt(workspace))?;
    Ok(WorkspaceKey(*derived))
}
