/// Identity key lookup.
///
/// `KeyProvider` is the boundary to whatever holds users' keypairs. The
/// server only needs public keys; a client also unlocks its own private key.
///
/// `FileKeyStore` keeps one pair of PEM files per identity:
///
/// ```text
/// <dir>/<identity>.pub   PUBLIC KEY             raw 32-byte Ed25519 public key
/// <dir>/<identity>.key   ENCRYPTED PRIVATE KEY  salt(16) | m | t | p (u32 BE each) | nonce(12) | AES-256-GCM(seed)
/// ```
///
/// The private key file is sealed with a key derived from the passphrase.
/// The Argon2 cost it was sealed at is stored with it and used to unseal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use sharebox_types::models::{NameError, validate_identity};
use tracing::info;

use crate::error::CryptoError;
use crate::kdf::{KdfParams, SALT_SIZE};
use crate::keys::{PRIVATE_KEY_SIZE, PublicKey, SecretKey, random_bytes};

const PRIVATE_PEM_TAG: &str = "ENCRYPTED PRIVATE KEY";
const NONCE_SIZE: usize = 12;
const PARAMS_SIZE: usize = 12;
const HEADER_SIZE: usize = SALT_SIZE + PARAMS_SIZE + NONCE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("no public key for {0}")]
    UnknownIdentity(String),
    #[error("no private key for {0}")]
    NoPrivateKey(String),
    #[error("wrong passphrase for {0}")]
    WrongPassphrase(String),
    #[error("malformed key file {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] NameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("key store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Source of identity keys.
pub trait KeyProvider: Send + Sync {
    fn public_key_of(&self, identity: &str) -> Result<PublicKey, KeyStoreError>;

    fn private_key_of_local_user(&self, identity: &str, passphrase: &str) -> Result<SecretKey, KeyStoreError>;
}

/// Directory-backed key store.
pub struct FileKeyStore {
    dir: PathBuf,
    params: KdfParams,
}

impl FileKeyStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, params: KdfParams::default() })
    }

    pub fn with_params(mut self, params: KdfParams) -> Self {
        self.params = params;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn public_path(&self, identity: &str) -> Result<PathBuf, KeyStoreError> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("{identity}.pub")))
    }

    fn private_path(&self, identity: &str) -> Result<PathBuf, KeyStoreError> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("{identity}.key")))
    }

    /// Create a fresh keypair for `identity` and store both halves.
    pub fn generate(&self, identity: &str, passphrase: &str) -> Result<SecretKey, KeyStoreError> {
        let key = SecretKey::generate();
        self.store(identity, &key, passphrase)?;
        info!("Generated identity key for {} ({})", identity, key.public().fingerprint());
        Ok(key)
    }

    /// Store a keypair, sealing the private half under `passphrase`.
    pub fn store(&self, identity: &str, key: &SecretKey, passphrase: &str) -> Result<(), KeyStoreError> {
        self.import_public(identity, &key.public())?;

        let salt: [u8; SALT_SIZE] = random_bytes();
        let nonce: [u8; NONCE_SIZE] = random_bytes();
        let wrapping = self.params.derive(passphrase.as_bytes(), &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &key.to_bytes()[..])
            .map_err(|_| CryptoError::Encrypt)?;

        let mut contents = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        contents.extend_from_slice(&salt);
        for field in [self.params.memory_kib, self.params.iterations, self.params.parallelism] {
            contents.extend_from_slice(&field.to_be_bytes());
        }
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&ciphertext);
        fs::write(
            self.private_path(identity)?,
            pem::encode(&pem::Pem::new(PRIVATE_PEM_TAG, contents)),
        )?;
        Ok(())
    }

    /// Trust a peer's public key.
    pub fn import_public(&self, identity: &str, key: &PublicKey) -> Result<(), KeyStoreError> {
        fs::write(self.public_path(identity)?, key.to_pem())?;
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, KeyStoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl KeyProvider for FileKeyStore {
    fn public_key_of(&self, identity: &str) -> Result<PublicKey, KeyStoreError> {
        let path = self.public_path(identity)?;
        let text = read_optional(&path)?.ok_or_else(|| KeyStoreError::UnknownIdentity(identity.to_string()))?;
        PublicKey::from_pem(&text).map_err(|e| KeyStoreError::Malformed { path, reason: e.to_string() })
    }

    fn private_key_of_local_user(&self, identity: &str, passphrase: &str) -> Result<SecretKey, KeyStoreError> {
        let path = self.private_path(identity)?;
        let text = read_optional(&path)?.ok_or_else(|| KeyStoreError::NoPrivateKey(identity.to_string()))?;
        let malformed = |reason: &str| KeyStoreError::Malformed { path: path.clone(), reason: reason.to_string() };

        let pem = pem::parse(&text).map_err(|_| malformed("not PEM"))?;
        if pem.tag() != PRIVATE_PEM_TAG {
            return Err(malformed("unexpected PEM tag"));
        }
        let contents = pem.contents();
        if contents.len() <= HEADER_SIZE {
            return Err(malformed("too short"));
        }
        let (salt, rest) = contents.split_at(SALT_SIZE);
        let (cost, rest) = rest.split_at(PARAMS_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let field = |i: usize| u32::from_be_bytes([cost[i], cost[i + 1], cost[i + 2], cost[i + 3]]);
        let params = KdfParams { memory_kib: field(0), iterations: field(4), parallelism: field(8) };

        let wrapping = params
            .derive(passphrase.as_bytes(), salt)
            .map_err(|_| malformed("bad key derivation parameters"))?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping[..]));
        let seed = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyStoreError::WrongPassphrase(identity.to_string()))?;
        let seed: [u8; PRIVATE_KEY_SIZE] = seed.as_slice().try_into().map_err(|_| malformed("bad key length"))?;
        Ok(SecretKey::from_bytes(&seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap().with_params(KdfParams::for_tests());
        (dir, store)
    }

    #[test]
    fn generate_then_load() {
        let (_dir, store) = store();
        let key = store.generate("alice", "pw").unwrap();
        assert_eq!(store.public_key_of("alice").unwrap(), key.public());
        let loaded = store.private_key_of_local_user("alice", "pw").unwrap();
        assert_eq!(loaded.public(), key.public());
    }

    #[test]
    fn wrong_passphrase_rejected() {
        let (_dir, store) = store();
        store.generate("alice", "pw").unwrap();
        assert!(matches!(
            store.private_key_of_local_user("alice", "nope"),
            Err(KeyStoreError::WrongPassphrase(_))
        ));
    }

    #[test]
    fn key_sealed_at_old_cost_still_opens() {
        let (dir, store) = store();
        let key = store.generate("alice", "pw").unwrap();

        let stronger = FileKeyStore::open(dir.path())
            .unwrap()
            .with_params(KdfParams { memory_kib: 128, iterations: 2, parallelism: 1 });
        let loaded = stronger.private_key_of_local_user("alice", "pw").unwrap();
        assert_eq!(loaded.public(), key.public());
    }

    #[test]
    fn unknown_identity() {
        let (_dir, store) = store();
        assert!(matches!(store.public_key_of("carol"), Err(KeyStoreError::UnknownIdentity(_))));
        assert!(matches!(
            store.private_key_of_local_user("carol", "pw"),
            Err(KeyStoreError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn identity_cannot_escape_directory() {
        let (_dir, store) = store();
        assert!(matches!(store.public_key_of("../etc/passwd"), Err(KeyStoreError::InvalidIdentity(_))));
    }

    #[test]
    fn imported_public_key_is_trusted() {
        let (_dir, store) = store();
        let bob = SecretKey::generate();
        store.import_public("bob", &bob.public()).unwrap();
        assert_eq!(store.public_key_of("bob").unwrap(), bob.public());
    }
}
