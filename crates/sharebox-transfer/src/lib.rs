/// sharebox transfer: length-framed messages and files over a byte stream.
///
/// Every frame is a 4-byte big-endian length followed by exactly that many
/// payload bytes. Payloads are copied through a bounded buffer, so file size
/// never dictates memory use. The same framing carries control messages,
/// envelopes, signatures and file bodies.

pub mod channel;
pub mod error;
pub mod logging;
pub mod protocol;

pub use channel::FramedChannel;
pub use error::TransferError;
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{DEFAULT_BUFFER_SIZE, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE};
