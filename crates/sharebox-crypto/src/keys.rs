use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::CryptoError;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

const PUBLIC_PEM_TAG: &str = "PUBLIC KEY";

/// Fill an array from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Public half of an identity keypair (Ed25519).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidKey("public key is not a valid point"))
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0.as_bytes()[..8])
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PUBLIC_PEM_TAG, self.to_bytes().to_vec()))
    }

    pub fn from_pem(text: &str) -> Result<Self, CryptoError> {
        let pem = pem::parse(text).map_err(|_| CryptoError::InvalidKey("malformed PEM"))?;
        if pem.tag() != PUBLIC_PEM_TAG {
            return Err(CryptoError::InvalidKey("expected a PUBLIC KEY block"));
        }
        Self::from_bytes(pem.contents())
    }

    /// Map the Edwards point to its Montgomery form for X25519.
    pub(crate) fn to_x25519(&self) -> Result<X25519PublicKey, CryptoError> {
        let point = CompressedEdwardsY::from_slice(self.0.as_bytes())
            .map_err(|_| CryptoError::InvalidKey("public key invalid edwards point"))?
            .decompress()
            .ok_or(CryptoError::InvalidKey("public key failed to decompress"))?;
        Ok(X25519PublicKey::from(point.to_montgomery().to_bytes()))
    }

    /// Verify a detached 64-byte signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.0
            .verify_strict(msg, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// Private half of an identity keypair. Zeroized on drop.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        Self(SigningKey::from_bytes(&random_bytes()))
    }

    pub fn from_bytes(bytes: &[u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.0.sign(msg).to_bytes()
    }

    /// The Ed25519 scalar used directly as the X25519 private key.
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0.to_scalar_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.public().fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_pem_roundtrip() {
        let secret = SecretKey::generate();
        let public = secret.public();
        let pem = public.to_pem();
        assert!(pem.contains("BEGIN PUBLIC KEY"));
        assert_eq!(PublicKey::from_pem(&pem).unwrap(), public);
    }

    #[test]
    fn wrong_pem_tag_rejected() {
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![0u8; 32]));
        assert!(PublicKey::from_pem(&pem).is_err());
    }

    #[test]
    fn x25519_conversion_agrees() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        let ab = alice.to_x25519().diffie_hellman(&bob.public().to_x25519().unwrap());
        let ba = bob.to_x25519().diffie_hellman(&alice.public().to_x25519().unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn signature_rejects_other_key() {
        let alice = SecretKey::generate();
        let mallory = SecretKey::generate();
        let sig = alice.sign(b"digest");
        assert!(alice.public().verify(b"digest", &sig).is_ok());
        assert!(mallory.public().verify(b"digest", &sig).is_err());
        assert!(alice.public().verify(b"other", &sig).is_err());
        assert!(alice.public().verify(b"digest", &sig[..10]).is_err());
    }

    #[test]
    fn secret_key_bytes_roundtrip() {
        let secret = SecretKey::generate();
        let restored = SecretKey::from_bytes(&secret.to_bytes());
        assert_eq!(restored.public(), secret.public());
    }
}
