/// sharebox cryptography.
///
/// - Identity keys: Ed25519 keypairs, mapped to X25519 for key agreement
/// - Workspace keys: 256-bit, derived from the workspace password with Argon2id
/// - Envelopes: ephemeral ECDH + AES key wrap, one per (workspace, member)
/// - File bodies: chunked AES-256-GCM over fixed-size buffers
/// - Signatures: detached Ed25519 signatures over the SHA-256 digest of the plaintext
/// - Metadata MAC: HMAC-SHA-256 keyed from the administrator passphrase
///
/// The server only ever handles envelopes and ciphertext. Plaintext and
/// private keys stay with the client.

pub mod encrypt;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod keystore;
pub mod mac;
pub mod sign;

pub use envelope::{ENVELOPE_SIZE, create_envelope, open_envelope};
pub use error::CryptoError;
pub use kdf::{KdfParams, PasswordVerifier, WorkspaceKey, derive_workspace_key};
pub use keys::{PublicKey, SecretKey};
pub use keystore::{FileKeyStore, KeyProvider, KeyStoreError};
pub use mac::MacKey;
