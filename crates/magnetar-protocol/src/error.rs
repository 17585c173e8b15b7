use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    #[error("CRC32C mismatch: expected {expected:#010x}, got {actual:#010x} (sequence {sequence_id})")]
    ChecksumMismatch {
        expected: u32,
        actual: u32,
        sequence_id: u64,
    },

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unknown compression type: {0}")]
    UnknownCompression(i32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
