//! Payload compression codecs negotiated via `MessageMetadata.compression`.
//!
//! Decompression sizes the output from the metadata's `uncompressed_size`
//! field, so the codecs run in size-independent block mode.

use crate::error::{ProtocolError, Result};
use crate::proto;
use std::io::Write;

/// Compression applied to a message (or sealed batch) payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
    Zstd,
    Snappy,
}

impl CompressionType {
    pub fn to_proto(self) -> proto::CompressionType {
        match self {
            Self::None => proto::CompressionType::None,
            Self::Lz4 => proto::CompressionType::Lz4,
            Self::Zlib => proto::CompressionType::Zlib,
            Self::Zstd => proto::CompressionType::Zstd,
            Self::Snappy => proto::CompressionType::Snappy,
        }
    }

    pub fn from_proto(raw: i32) -> Result<Self> {
        match proto::CompressionType::try_from(raw) {
            Ok(proto::CompressionType::None) => Ok(Self::None),
            Ok(proto::CompressionType::Lz4) => Ok(Self::Lz4),
            Ok(proto::CompressionType::Zlib) => Ok(Self::Zlib),
            Ok(proto::CompressionType::Zstd) => Ok(Self::Zstd),
            Ok(proto::CompressionType::Snappy) => Ok(Self::Snappy),
            Err(_) => Err(ProtocolError::UnknownCompression(raw)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), false)
                .map_err(|e| ProtocolError::Compression(format!("lz4: {}", e))),
            Self::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| ProtocolError::Compression(format!("zlib: {}", e)))
            }
            Self::Zstd => zstd::bulk::compress(data, 0)
                .map_err(|e| ProtocolError::Compression(format!("zstd: {}", e))),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| ProtocolError::Compression(format!("snappy: {}", e))),
        }
    }

    /// `uncompressed_size` comes from the message metadata and bounds the
    /// output allocation.
    pub fn decompress(self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Self::None => data.to_vec(),
            Self::Lz4 => lz4::block::decompress(data, Some(uncompressed_size as i32))
                .map_err(|e| ProtocolError::Compression(format!("lz4: {}", e)))?,
            Self::Zlib => {
                let mut decoder = flate2::write::ZlibDecoder::new(Vec::with_capacity(uncompressed_size));
                decoder
                    .write_all(data)
                    .and_then(|_| decoder.finish())
                    .map_err(|e| ProtocolError::Compression(format!("zlib: {}", e)))?
            }
            Self::Zstd => zstd::bulk::decompress(data, uncompressed_size)
                .map_err(|e| ProtocolError::Compression(format!("zstd: {}", e)))?,
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| ProtocolError::Compression(format!("snappy: {}", e)))?,
        };
        if self != Self::None && out.len() != uncompressed_size {
            return Err(ProtocolError::Compression(format!(
                "{}: decompressed {} bytes, metadata said {}",
                self.as_str(),
                out.len(),
                uncompressed_size
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] =
        b"a moderately repetitive payload payload payload payload for the codecs to chew on";

    #[test]
    fn test_all_codecs_roundtrip() {
        for codec in [
            CompressionType::None,
            CompressionType::Lz4,
            CompressionType::Zlib,
            CompressionType::Zstd,
            CompressionType::Snappy,
        ] {
            let compressed = codec.compress(SAMPLE).unwrap();
            let restored = codec.decompress(&compressed, SAMPLE.len()).unwrap();
            assert_eq!(restored, SAMPLE, "codec {}", codec.as_str());
        }
    }

    #[test]
    fn test_proto_mapping_roundtrip() {
        for codec in [
            CompressionType::None,
            CompressionType::Lz4,
            CompressionType::Zlib,
            CompressionType::Zstd,
            CompressionType::Snappy,
        ] {
            assert_eq!(
                CompressionType::from_proto(codec.to_proto() as i32).unwrap(),
                codec
            );
        }
        assert!(CompressionType::from_proto(99).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let compressed = CompressionType::Lz4.compress(SAMPLE).unwrap();
        assert!(CompressionType::Lz4
            .decompress(&compressed, SAMPLE.len() + 1)
            .is_err());
    }
}
