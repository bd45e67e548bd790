use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer closed the stream cleanly between frames.
    #[error("peer disconnected")]
    Disconnected,
    /// The stream ended inside a frame.
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: u64, limit: u64 },
    /// A local source produced fewer bytes than its announced length.
    #[error("source yielded {read} of {expected} announced bytes")]
    SourceShort { expected: u64, read: u64 },
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// True when a socket read/write timeout fired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }
}
