/// Detached signatures over file contents.
///
/// The signature blob is the uploader's Ed25519 signature over the SHA-256
/// digest of the plaintext. Verification recomputes the digest locally and
/// checks the blob against the claimed signer's public key.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::keys::{PublicKey, SIGNATURE_SIZE, SecretKey};

pub const DIGEST_SIZE: usize = 32;

const READ_BUFFER: usize = 64 * 1024;

/// SHA-256 of everything `reader` yields.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<[u8; DIGEST_SIZE]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

pub fn digest_file(path: &Path) -> io::Result<[u8; DIGEST_SIZE]> {
    digest_reader(File::open(path)?)
}

/// Sign the digest of a file.
pub fn sign_file(key: &SecretKey, path: &Path) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    let digest = digest_file(path)?;
    Ok(key.sign(&digest))
}

/// Check a signature blob against the digest of a local plaintext file.
pub fn verify_file(signer: &PublicKey, path: &Path, signature: &[u8]) -> Result<(), CryptoError> {
    let digest = digest_file(path)?;
    signer.verify(&digest, signature)
}
