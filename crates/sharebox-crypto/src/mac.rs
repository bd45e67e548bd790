/// HMAC-SHA-256 tags over the metadata files.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;
use crate::kdf::KdfParams;

type HmacSha256 = Hmac<Sha256>;

pub const TAG_SIZE: usize = 32;

/// MAC key derived from the administrator passphrase and a persisted salt.
///
/// Holds the keyed HMAC state; each tag starts from a clone of it.
#[derive(Clone)]
pub struct MacKey(HmacSha256);

impl MacKey {
    pub fn derive(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<Self, CryptoError> {
        let key = params.derive(passphrase.as_bytes(), salt)?;
        let mac = <HmacSha256 as Mac>::new_from_slice(&key[..])
            .map_err(|_| CryptoError::InvalidKey("HMAC key rejected"))?;
        Ok(Self(mac))
    }

    pub fn tag(&self, data: &[u8]) -> [u8; TAG_SIZE] {
        let mut mac = self.0.clone();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time comparison against a stored tag.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.0.clone();
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}
