use std::io;

use sharebox_crypto::{CryptoError, KeyStoreError};
use sharebox_transfer::TransferError;
use sharebox_types::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Keys(#[from] KeyStoreError),
    #[error("unexpected server reply: {0}")]
    Protocol(#[from] ParseError),
    #[error("call authenticate first")]
    NotAuthenticated,
    #[error("client I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<tempfile::PersistError> for ClientError {
    fn from(e: tempfile::PersistError) -> Self {
        Self::Io(e.error)
    }
}
