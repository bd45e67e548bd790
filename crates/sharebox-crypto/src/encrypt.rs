/// Chunked AES-256-GCM encryption of file bodies:
///
/// ```text
/// header:  "SBX1" (4) | file_nonce (8, random)
/// chunk i: AES-256-GCM(key, nonce = file_nonce | i (u32 BE),
///                      aad = i (u32 BE) | final (u8))   -> plaintext + 16-byte tag
/// ```
///
/// Every chunk holds `FILE_CHUNK_SIZE` plaintext bytes except the final one,
/// which may be shorter (or empty for an empty file). Binding the index and
/// the final flag into the AAD detects reordering, truncation and extension.

use std::io::{self, BufRead, BufReader, Read, Write};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore},
};

use crate::error::CryptoError;
use crate::kdf::WorkspaceKey;

/// Plaintext bytes per chunk.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// GCM authentication tag per chunk.
pub const TAG_SIZE: usize = 16;

const MAGIC: &[u8; 4] = b"SBX1";
const FILE_NONCE_SIZE: usize = 8;
pub const HEADER_SIZE: usize = MAGIC.len() + FILE_NONCE_SIZE;
const SEALED_CHUNK_SIZE: usize = FILE_CHUNK_SIZE + TAG_SIZE;

/// Size of the encrypted form of a `plain_len`-byte file.
pub fn encrypted_len(plain_len: u64) -> u64 {
    let chunks = plain_len.div_ceil(FILE_CHUNK_SIZE as u64).max(1);
    HEADER_SIZE as u64 + plain_len + chunks * TAG_SIZE as u64
}

fn chunk_nonce(file_nonce: &[u8; FILE_NONCE_SIZE], index: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..FILE_NONCE_SIZE].copy_from_slice(file_nonce);
    nonce[FILE_NONCE_SIZE..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn chunk_aad(index: u32, last: bool) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(&index.to_be_bytes());
    aad[4] = last as u8;
    aad
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt everything `reader` yields into `writer`.
/// Returns the number of plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &WorkspaceKey,
    reader: R,
    mut writer: W,
) -> Result<u64, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut file_nonce = [0u8; FILE_NONCE_SIZE];
    OsRng.fill_bytes(&mut file_nonce);
    writer.write_all(MAGIC)?;
    writer.write_all(&file_nonce)?;

    let mut reader = BufReader::with_capacity(FILE_CHUNK_SIZE, reader);
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut index: u32 = 0;
    let mut total: u64 = 0;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        let last = n < FILE_CHUNK_SIZE || reader.fill_buf()?.is_empty();

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&chunk_nonce(&file_nonce, index)),
                Payload { msg: &buf[..n], aad: &chunk_aad(index, last) },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        writer.write_all(&sealed)?;
        total += n as u64;

        if last {
            break;
        }
        index = index.checked_add(1).ok_or(CryptoError::TooLarge)?;
    }

    writer.flush()?;
    Ok(total)
}

/// Decrypt a stream produced by `encrypt_stream` into `writer`.
/// Returns the number of plaintext bytes written.
///
/// On error, `writer` may already hold a prefix of the plaintext; callers
/// must discard it.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &WorkspaceKey,
    reader: R,
    mut writer: W,
) -> Result<u64, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut reader = BufReader::with_capacity(SEALED_CHUNK_SIZE, reader);

    let mut header = [0u8; HEADER_SIZE];
    if read_full(&mut reader, &mut header)? < HEADER_SIZE {
        return Err(CryptoError::Truncated);
    }
    if &header[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::BadHeader);
    }
    let mut file_nonce = [0u8; FILE_NONCE_SIZE];
    file_nonce.copy_from_slice(&header[MAGIC.len()..]);

    let mut buf = vec![0u8; SEALED_CHUNK_SIZE];
    let mut index: u32 = 0;
    let mut total: u64 = 0;

    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n < TAG_SIZE {
            return Err(CryptoError::Truncated);
        }
        let last = n < SEALED_CHUNK_SIZE || reader.fill_buf()?.is_empty();

        let plain = cipher
            .decrypt(
                Nonce::from_slice(&chunk_nonce(&file_nonce, index)),
                Payload { msg: &buf[..n], aad: &chunk_aad(index, last) },
            )
            .map_err(|_| CryptoError::Decrypt { chunk: index })?;
        writer.write_all(&plain)?;
        total += plain.len() as u64;

        if last {
            break;
        }
        index = index.checked_add(1).ok_or(CryptoError::TooLarge)?;
    }

    writer.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{KdfParams, derive_workspace_key};

    fn key() -> WorkspaceKey {
        derive_workspace_key("pw", "reports", &KdfParams::for_tests()).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn seal(key: &WorkspaceKey, plain: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream(key, plain, &mut out).unwrap();
        out
    }

    fn open(key: &WorkspaceKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        decrypt_stream(key, sealed, &mut out)?;
        Ok(out)
    }

    #[test]
    fn stream_roundtrip_around_chunk_boundaries() {
        let key = key();
        for len in [0, 1, FILE_CHUNK_SIZE - 1, FILE_CHUNK_SIZE, FILE_CHUNK_SIZE + 1, 3 * FILE_CHUNK_SIZE + 17] {
            let plain = pattern(len);
            let sealed = seal(&key, &plain);
            assert_eq!(sealed.len() as u64, encrypted_len(len as u64), "len {len}");
            assert_eq!(open(&key, &sealed).unwrap(), plain, "len {len}");
        }
    }

    #[test]
    fn stream_wrong_key_fails() {
        let sealed = seal(&key(), &pattern(1000));
        let other = derive_workspace_key("other", "reports", &KdfParams::for_tests()).unwrap();
        assert!(matches!(open(&other, &sealed), Err(CryptoError::Decrypt { chunk: 0 })));
    }

    #[test]
    fn bit_flip_detected() {
        let key = key();
        let mut sealed = seal(&key, &pattern(2 * FILE_CHUNK_SIZE + 5));
        let mid = HEADER_SIZE + SEALED_CHUNK_SIZE + 10;
        sealed[mid] ^= 0x80;
        assert!(matches!(open(&key, &sealed), Err(CryptoError::Decrypt { chunk: 1 })));
    }

    #[test]
    fn truncation_at_chunk_boundary_detected() {
        let key = key();
        let sealed = seal(&key, &pattern(2 * FILE_CHUNK_SIZE + 5));
        let cut = &sealed[..HEADER_SIZE + SEALED_CHUNK_SIZE];
        assert!(open(&key, cut).unwrap_err().is_integrity_failure());
    }

    #[test]
    fn header_checks() {
        let key = key();
        assert!(matches!(open(&key, b"SBX1"), Err(CryptoError::Truncated)));
        let mut sealed = seal(&key, b"abc");
        sealed[0] = b'X';
        assert!(matches!(open(&key, &sealed), Err(CryptoError::BadHeader)));
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let key = key();
        assert_ne!(seal(&key, b"same"), seal(&key, b"same"));
    }
}
