/// Workspace key envelopes.
///
/// An envelope wraps a workspace key for exactly one member:
///
/// ```text
/// [ ephemeral_pubkey: 32 bytes ][ AES-KW(shared_secret, workspace_key): 40 bytes ]
/// ```
///
/// The shared secret is the X25519 agreement between a fresh ephemeral key
/// and the recipient's identity key. Only the recipient's private key
/// recovers it; any other key fails the key-wrap integrity check.

use aes_kw::KekAes256 as Kek;

use crate::error::CryptoError;
use crate::kdf::{KEY_SIZE, WorkspaceKey};
use crate::keys::{PUBLIC_KEY_SIZE, PublicKey, SecretKey};

/// AES-KW adds one 8-byte block to the wrapped key.
const KW_OVERHEAD: usize = 8;

pub const ENVELOPE_SIZE: usize = PUBLIC_KEY_SIZE + KEY_SIZE + KW_OVERHEAD;

/// Wrap `key` for `recipient`.
pub fn create_envelope(key: &WorkspaceKey, recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::generate();
    let shared = ephemeral.to_x25519().diffie_hellman(&recipient.to_x25519()?);

    let kek = Kek::from(*shared.as_bytes());
    let wrapped = kek.wrap_vec(key.as_bytes()).map_err(|_| CryptoError::Encrypt)?;

    let mut envelope = Vec::with_capacity(ENVELOPE_SIZE);
    envelope.extend_from_slice(&ephemeral.public().to_bytes());
    envelope.extend_from_slice(&wrapped);
    debug_assert_eq!(envelope.len(), ENVELOPE_SIZE);
    Ok(envelope)
}

/// Recover the workspace key with the recipient's private key.
pub fn open_envelope(envelope: &[u8], recipient: &SecretKey) -> Result<WorkspaceKey, CryptoError> {
    if envelope.len() != ENVELOPE_SIZE {
        return Err(CryptoError::EnvelopeSize(envelope.len()));
    }
    let (ephemeral, wrapped) = envelope.split_at(PUBLIC_KEY_SIZE);
    let ephemeral = PublicKey::from_bytes(ephemeral).map_err(|_| CryptoError::EnvelopeOpen)?;

    let shared = recipient.to_x25519().diffie_hellman(&ephemeral.to_x25519()?);
    let kek = Kek::from(*shared.as_bytes());
    let unwrapped = kek.unwrap_vec(wrapped).map_err(|_| CryptoError::EnvelopeOpen)?;

    let bytes: [u8; KEY_SIZE] = unwrapped
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::EnvelopeOpen)?;
    Ok(WorkspaceKey::from_bytes(bytes))
}
