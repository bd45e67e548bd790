/// Structured transfer logging.
///
/// The channel reports payload-level events to a `TransferLogger`; the
/// default writes them to `tracing`.

use std::fmt;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: String,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A streamed payload was fully written
    PayloadSent { bytes: u64, duration_ms: u64 },
    /// A streamed payload was fully received
    PayloadReceived { bytes: u64, duration_ms: u64 },
    /// The stream ended inside a frame
    Truncated { expected: u64, received: u64 },
    /// A frame exceeded the receiver's limit
    Rejected { len: u64, limit: u64 },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadSent { bytes, duration_ms } => {
                write!(f, "payload_sent bytes={} duration_ms={}", bytes, duration_ms)
            }
            Self::PayloadReceived { bytes, duration_ms } => {
                write!(f, "payload_received bytes={} duration_ms={}", bytes, duration_ms)
            }
            Self::Truncated { expected, received } => {
                write!(f, "truncated expected={} received={}", expected, received)
            }
            Self::Rejected { len, limit } => {
                write!(f, "rejected len={} limit={}", len, limit)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // warn for broken frames, debug for per-payload spam
        match &entry.event {
            TransferEvent::Truncated { .. }
            | TransferEvent::Rejected { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, peer = %entry.peer, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
