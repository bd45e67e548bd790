use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::error::TransferError;
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{
    DEFAULT_BUFFER_SIZE, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE, decode_header, encode_header,
};

const COMPONENT: &str = "channel";

/// A length-framed channel over any reliable byte stream.
///
/// Payload bytes always move through one bounded buffer; a receiver never
/// trusts the header beyond the limit its caller passes in.
pub struct FramedChannel<S> {
    stream: S,
    buffer: Vec<u8>,
    logger: Arc<dyn TransferLogger>,
    peer: String,
}

impl<S: Read + Write> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: vec![0u8; DEFAULT_BUFFER_SIZE],
            logger: Arc::new(TracingLogger),
            peer: "-".to_string(),
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer = vec![0u8; size.max(1)];
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Label used in transfer logs.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog { component: COMPONENT, peer: self.peer.clone(), event });
    }

    // ── Sending ──

    /// Send an in-memory payload as one frame.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let len = frame_len(data.len() as u64)?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
        frame.extend_from_slice(&encode_header(len));
        frame.extend_from_slice(data);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Send a UTF-8 control message.
    pub fn send_message(&mut self, message: &str) -> Result<(), TransferError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(TransferError::TooLarge {
                len: message.len() as u64,
                limit: MAX_MESSAGE_SIZE as u64,
            });
        }
        self.send_bytes(message.as_bytes())
    }

    /// Stream exactly `len` bytes from `reader` as one frame.
    ///
    /// If the reader runs dry early the frame is already announced, so the
    /// stream is out of sync and must be dropped.
    pub fn send_reader<R: Read>(&mut self, mut reader: R, len: u64) -> Result<u64, TransferError> {
        let started = Instant::now();
        self.stream.write_all(&encode_header(frame_len(len)?))?;

        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(self.buffer.len() as u64) as usize;
            let n = match reader.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    let err = TransferError::SourceShort { expected: len, read: len - remaining };
                    self.log(TransferEvent::Error { message: err.to_string() });
                    return Err(err);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.stream.write_all(&self.buffer[..n])?;
            remaining -= n as u64;
        }
        self.stream.flush()?;

        self.log(TransferEvent::PayloadSent {
            bytes: len,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(len)
    }

    /// Send a file as one frame. A missing file fails before anything is
    /// written to the stream.
    pub fn send_file(&mut self, path: &Path) -> Result<u64, TransferError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        self.send_reader(file, len)
    }

    // ── Receiving ──

    fn read_header(&mut self) -> Result<u64, TransferError> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.stream.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Err(TransferError::Disconnected),
                Ok(0) => {
                    let err = TransferError::Truncated {
                        expected: HEADER_SIZE as u64,
                        received: filled as u64,
                    };
                    self.log(TransferEvent::Truncated { expected: HEADER_SIZE as u64, received: filled as u64 });
                    return Err(err);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(decode_header(header) as u64)
    }

    /// Copy exactly `len` payload bytes into `writer`.
    fn copy_payload<W: Write>(&mut self, len: u64, writer: &mut W) -> Result<(), TransferError> {
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(self.buffer.len() as u64) as usize;
            let n = match self.stream.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    let received = len - remaining;
                    self.log(TransferEvent::Truncated { expected: len, received });
                    return Err(TransferError::Truncated { expected: len, received });
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            writer.write_all(&self.buffer[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Receive one frame into memory, refusing frames over `limit` bytes.
    /// A refused frame is left unread; the caller should drop the stream.
    pub fn receive_bytes(&mut self, limit: usize) -> Result<Vec<u8>, TransferError> {
        let len = self.read_header()?;
        if len > limit as u64 {
            self.log(TransferEvent::Rejected { len, limit: limit as u64 });
            return Err(TransferError::TooLarge { len, limit: limit as u64 });
        }
        let mut data = Vec::with_capacity(len as usize);
        self.copy_payload(len, &mut data)?;
        Ok(data)
    }

    /// Receive a UTF-8 control message.
    pub fn receive_message(&mut self) -> Result<String, TransferError> {
        let data = self.receive_bytes(MAX_MESSAGE_SIZE)?;
        String::from_utf8(data).map_err(|_| TransferError::InvalidUtf8)
    }

    /// Stream one frame into `writer`. Returns the payload length.
    pub fn receive_into<W: Write>(&mut self, mut writer: W) -> Result<u64, TransferError> {
        let started = Instant::now();
        let len = self.read_header()?;
        self.copy_payload(len, &mut writer)?;
        writer.flush()?;
        self.log(TransferEvent::PayloadReceived {
            bytes: len,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(len)
    }

    /// Receive one frame into `path`.
    ///
    /// Bytes land in a temporary file beside `path`, which replaces `path`
    /// only after the whole payload arrived. On error nothing is left behind.
    pub fn receive_file(&mut self, path: &Path) -> Result<u64, TransferError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = tempfile::Builder::new().prefix(".incoming-").tempfile_in(dir)?;
        let len = self.receive_into(staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| TransferError::Io(e.error))?;
        Ok(len)
    }

    /// Read and drop one frame, keeping the stream in sync.
    pub fn discard_payload(&mut self) -> Result<u64, TransferError> {
        self.receive_into(io::sink())
    }

    /// Like `receive_into`, but a failing writer does not end the transfer:
    /// the rest of the frame is read and dropped, and the writer's error is
    /// returned in the inner `Result`. The outer error is always the stream's.
    pub fn receive_into_or_drain<W: Write>(&mut self, writer: W) -> Result<io::Result<u64>, TransferError> {
        let mut spill = Spill { inner: writer, error: None };
        let len = self.receive_into(&mut spill)?;
        Ok(match spill.error {
            Some(e) => {
                self.log(TransferEvent::Error { message: format!("local write failed, frame drained: {e}") });
                Err(e)
            }
            None => Ok(len),
        })
    }
}

/// Forwards to `inner` until the first error, then swallows everything.
struct Spill<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W: Write> Write for Spill<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error.is_none() {
            if let Err(e) = self.inner.write_all(buf) {
                self.error = Some(e);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.error.is_none() {
            if let Err(e) = self.inner.flush() {
                self.error = Some(e);
            }
        }
        Ok(())
    }
}

fn frame_len(len: u64) -> Result<u32, TransferError> {
    u32::try_from(len).map_err(|_| TransferError::TooLarge { len, limit: MAX_PAYLOAD_SIZE })
}
