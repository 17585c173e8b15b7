//! Length-prefixed command framing with CRC32C payload protection.
//!
//! ```text
//! simple command frame:
//! +----------------+----------------+---------------+
//! | totalSize u32  | cmdSize u32    | command bytes |
//! +----------------+----------------+---------------+
//!
//! payload command frame (SEND / MESSAGE):
//! +----------------+----------------+---------------+------------------+
//! | totalSize u32  | cmdSize u32    | command bytes | [broker entry    |
//! +----------------+----------------+---------------+  metadata 0x0e02]|
//! +----------------+----------------+------------------+---------------+
//! | magic 0x0e01   | checksum u32   | metadataSize u32 | metadata      |
//! +----------------+----------------+------------------+---------------+
//! | payload bytes  |
//! +----------------+
//! ```
//!
//! All integers big-endian. `totalSize` does not count itself. The CRC32C
//! checksum covers everything after the checksum field: metadataSize,
//! metadata, and payload.

use crate::error::{ProtocolError, Result};
use crate::proto::{BaseCommand, MessageMetadata, SingleMessageMetadata};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Magic preceding checksum + metadata in payload frames.
pub const PAYLOAD_MAGIC: u16 = 0x0e01;
/// Magic preceding optional broker entry metadata (skipped on decode).
pub const BROKER_ENTRY_METADATA_MAGIC: u16 = 0x0e02;
/// Hard cap on a single frame, matching the broker default (5 MB) plus
/// headroom for the envelope.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024 + 10 * 1024;

/// One decoded or to-be-encoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: BaseCommand,
    pub payload: Option<Payload>,
}

/// Metadata + payload section of a SEND / MESSAGE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub metadata: MessageMetadata,
    pub data: Bytes,
}

impl Frame {
    pub fn command(command: BaseCommand) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn with_payload(command: BaseCommand, metadata: MessageMetadata, data: Bytes) -> Self {
        Self {
            command,
            payload: Some(Payload { metadata, data }),
        }
    }
}

/// CRC32C over the checksum-protected region of a payload frame, exactly as
/// `encode` lays it out: `[metadataSize u32][metadata][payload]`.
pub fn payload_checksum(metadata: &MessageMetadata, payload: &[u8]) -> u32 {
    let meta_bytes = metadata.encode_to_vec();
    let mut crc = crc32c::crc32c(&(meta_bytes.len() as u32).to_be_bytes());
    crc = crc32c::crc32c_append(crc, &meta_bytes);
    crc32c::crc32c_append(crc, payload)
}

// ============================================================================
// Codec
// ============================================================================

/// Tokio codec splitting the TCP byte stream into [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let cmd_bytes = frame.command.encode_to_vec();
        let cmd_size = cmd_bytes.len();

        let total_size = match &frame.payload {
            None => 4 + cmd_size,
            Some(p) => {
                let meta_size = p.metadata.encoded_len();
                4 + cmd_size + 2 + 4 + 4 + meta_size + p.data.len()
            }
        };
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(4 + total_size);
        dst.put_u32(total_size as u32);
        dst.put_u32(cmd_size as u32);
        dst.put_slice(&cmd_bytes);

        if let Some(p) = &frame.payload {
            let meta_bytes = p.metadata.encode_to_vec();
            dst.put_u16(PAYLOAD_MAGIC);
            dst.put_u32(payload_checksum(&p.metadata, &p.data));
            dst.put_u32(meta_bytes.len() as u32);
            dst.put_slice(&meta_bytes);
            dst.put_slice(&p.data);
        }

        trace!(
            command = frame.command.type_name(),
            size = total_size,
            "encoded frame"
        );
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let total_size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < 4 + total_size {
            src.reserve(4 + total_size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(total_size).freeze();

        let cmd_size = read_u32(&mut body)? as usize;
        if body.remaining() < cmd_size {
            return Err(ProtocolError::Malformed("command overruns frame"));
        }
        let command = BaseCommand::decode(body.split_to(cmd_size))?;

        if !body.has_remaining() {
            return Ok(Some(Frame {
                command,
                payload: None,
            }));
        }

        // Brokers at newer protocol versions may prepend entry metadata;
        // the client skips it.
        let mut magic = read_u16(&mut body)?;
        if magic == BROKER_ENTRY_METADATA_MAGIC {
            let bem_size = read_u32(&mut body)? as usize;
            if body.remaining() < bem_size {
                return Err(ProtocolError::Malformed("broker entry metadata overruns frame"));
            }
            body.advance(bem_size);
            magic = read_u16(&mut body)?;
        }
        if magic != PAYLOAD_MAGIC {
            return Err(ProtocolError::Malformed("bad payload magic"));
        }

        let expected_checksum = read_u32(&mut body)?;
        let actual_checksum = crc32c::crc32c(&body);

        let meta_size = read_u32(&mut body)? as usize;
        if body.remaining() < meta_size {
            return Err(ProtocolError::Malformed("metadata overruns frame"));
        }
        let metadata = MessageMetadata::decode(body.split_to(meta_size))?;

        if actual_checksum != expected_checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
                sequence_id: metadata.sequence_id,
            });
        }

        Ok(Some(Frame {
            command,
            payload: Some(Payload {
                metadata,
                data: body,
            }),
        }))
    }
}

fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Malformed("truncated frame"));
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed("truncated frame"));
    }
    Ok(buf.get_u32())
}

// ============================================================================
// Batch payloads
// ============================================================================

/// One exploded entry of a batch payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub metadata: SingleMessageMetadata,
    pub payload: Bytes,
}

/// Append a batch entry: big-endian fixed32 metadata length, metadata,
/// then the entry payload.
pub fn write_batch_entry(buf: &mut BytesMut, metadata: &SingleMessageMetadata, payload: &[u8]) {
    let meta_bytes = metadata.encode_to_vec();
    buf.reserve(4 + meta_bytes.len() + payload.len());
    buf.put_u32(meta_bytes.len() as u32);
    buf.put_slice(&meta_bytes);
    buf.put_slice(payload);
}

/// Explode an (already decompressed) batch payload into its entries.
pub fn split_batch_payload(mut payload: Bytes, num_messages: i32) -> Result<Vec<BatchEntry>> {
    let mut entries = Vec::with_capacity(num_messages.max(0) as usize);
    for _ in 0..num_messages {
        let meta_size = read_u32(&mut payload)? as usize;
        if payload.remaining() < meta_size {
            return Err(ProtocolError::Malformed("batch entry metadata overruns payload"));
        }
        let metadata = SingleMessageMetadata::decode(payload.split_to(meta_size))?;
        let payload_size = metadata.payload_size.max(0) as usize;
        if payload.remaining() < payload_size {
            return Err(ProtocolError::Malformed("batch entry payload overruns payload"));
        }
        let data = payload.split_to(payload_size);
        entries.push(BatchEntry {
            metadata,
            payload: data,
        });
    }
    Ok(entries)
}
