use std::io;

use crate::envelope::ENVELOPE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("envelope is {0} bytes, expected {ENVELOPE_SIZE}")]
    EnvelopeSize(usize),
    #[error("envelope cannot be opened with this key")]
    EnvelopeOpen,
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext chunk {chunk} failed authentication")]
    Decrypt { chunk: u32 },
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("ciphertext header not recognised")]
    BadHeader,
    #[error("input exceeds the maximum chunk count")]
    TooLarge,
    #[error("signature does not match")]
    BadSignature,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CryptoError {
    /// True when the data failed authentication, as opposed to a local fault.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::Decrypt { .. } | Self::Truncated | Self::BadHeader | Self::BadSignature
        )
    }
}
