/// Frame format.
///
/// ```text
/// [0..4]  Payload length (u32 BE)
/// [4..]   Payload (length bytes)
/// ```

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Default copy buffer for payloads.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Maximum size of a text control message (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_SIZE: u64 = u32::MAX as u64;

pub fn encode_header(len: u32) -> [u8; HEADER_SIZE] {
    len.to_be_bytes()
}

pub fn decode_header(bytes: [u8; HEADER_SIZE]) -> u32 {
    u32::from_be_bytes(bytes)
}
