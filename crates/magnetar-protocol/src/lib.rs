//! # magnetar-protocol
//!
//! Wire protocol for [magnetar](https://github.com/magnetar-rs/magnetar), an
//! async Rust client for Apache-Pulsar-compatible brokers. This crate holds
//! everything that touches raw bytes:
//!
//! - **Protobuf schema**: hand-maintained prost messages mirroring
//!   `PulsarApi.proto` for the commands the client uses
//! - **Frame codec**: length-prefixed command (+ metadata + payload) frames
//!   with CRC32C protection, as a `tokio_util` [`codec`](tokio_util::codec)
//! - **Compression**: LZ4 / Zlib / Zstd / Snappy payload codecs
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────┬──────────────┬───────────────┬────────────────────────┐
//! │ totalSize u32 │ cmdSize u32  │ command bytes │ [payload section]      │
//! │ big-endian    │ big-endian   │ protobuf      │ magic+crc+meta+payload │
//! └───────────────┴──────────────┴───────────────┴────────────────────────┘
//! ```
//!
//! The payload section appears only on SEND and MESSAGE frames; see
//! [`frame`] for the exact layout and checksum coverage.

pub mod commands;
pub mod compression;
mod error;
pub mod frame;
pub mod proto;

pub use compression::CompressionType;
pub use error::{ProtocolError, Result};
pub use frame::{
    payload_checksum, split_batch_payload, write_batch_entry, BatchEntry, Frame, FrameCodec,
    Payload, MAX_FRAME_SIZE,
};
pub use proto::{BaseCommand, CommandType, MessageIdData, MessageMetadata, SingleMessageMetadata};
