use std::io;

use sharebox_crypto::CryptoError;
use sharebox_types::{NameError, RecordError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Metadata no longer matches its MAC. The process must stop.
    #[error("integrity violation: {file} does not match its MAC")]
    IntegrityViolation { file: &'static str },
    #[error("corrupt record in {file}: {source}")]
    Record {
        file: &'static str,
        #[source]
        source: RecordError,
    },
    #[error("no such workspace {0}")]
    NoSuchWorkspace(String),
    #[error("{0} has no signature")]
    MissingSignature(String),
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Errors that must stop the whole server.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IntegrityViolation { .. })
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(e: tempfile::PersistError) -> Self {
        Self::Io(e.error)
    }
}
