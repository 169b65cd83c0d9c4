//! Result payload compression.
//!
//! Payloads at or above the threshold are zstd-compressed when that makes
//! them strictly smaller. The `compressed` flag always reflects what was
//! applied, so `decode(encode(b)) == b` holds for every input.

use std::io::Read;

use crate::error::{Error, Result};
use crate::model::CallResult;

/// Payloads smaller than this are never compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 2048;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    threshold: usize,
    level: i32,
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_COMPRESSION_LEVEL)
    }
}

impl PayloadCodec {
    pub fn new(threshold: usize, level: i32) -> Self {
        Self { threshold, level }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn encode(&self, bytes: Vec<u8>) -> CallResult {
        if bytes.len() < self.threshold {
            return CallResult { payload: bytes, compressed: false };
        }

        match zstd::stream::encode_all(&bytes[..], self.level) {
            Ok(packed) if packed.len() < bytes.len() => {
                tracing::trace!(raw = bytes.len(), packed = packed.len(), "payload compressed");
                CallResult { payload: packed, compressed: true }
            }
            Ok(_) => CallResult { payload: bytes, compressed: false },
            Err(e) => {
                tracing::warn!("compression failed, sending raw payload: {}", e);
                CallResult { payload: bytes, compressed: false }
            }
        }
    }

    /// Reads a compressed payload through to the end of its stream.
    pub fn decode(result: &CallResult) -> Result<Vec<u8>> {
        if !result.compressed {
            return Ok(result.payload.clone());
        }

        let mut decoder = zstd::stream::read::Decoder::new(&result.payload[..])
            .map_err(|e| Error::Serialization(format!("zstd decoder: {}", e)))?;
        let mut out = Vec::with_capacity(result.payload.len() * 4);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Serialization(format!("zstd stream: {}", e)))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn roundtrip(codec: &PayloadCodec, bytes: Vec<u8>) -> CallResult {
        let encoded = codec.encode(bytes.clone());
        let decoded = PayloadCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, bytes);
        encoded
    }

    #[test]
    fn test_empty_and_single_byte() {
        let codec = PayloadCodec::default();
        assert!(!roundtrip(&codec, Vec::new()).compressed);
        assert!(!roundtrip(&codec, vec![0x7f]).compressed);
    }

    #[test]
    fn test_empty_with_zero_threshold() {
        // even a forced attempt on an empty payload must round-trip
        let codec = PayloadCodec::new(0, 3);
        let encoded = roundtrip(&codec, Vec::new());
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_below_threshold_passes_through() {
        let codec = PayloadCodec::default();
        let bytes = vec![b'a'; DEFAULT_COMPRESSION_THRESHOLD - 1];
        let encoded = roundtrip(&codec, bytes.clone());
        assert!(!encoded.compressed);
        assert_eq!(encoded.payload, bytes);
    }

    #[test]
    fn test_compressible_json_is_compressed() {
        let codec = PayloadCodec::default();
        let json: Vec<u8> = serde_json::to_vec(&vec![0.5f64; 4096]).unwrap();
        let encoded = roundtrip(&codec, json.clone());
        assert!(encoded.compressed);
        assert!(encoded.payload.len() < json.len());
    }

    #[test]
    fn test_incompressible_data_is_left_alone() {
        let codec = PayloadCodec::default();
        let mut bytes = vec![0u8; 64 * 1024];
        rand::thread_rng().fill_bytes(&mut bytes);
        let encoded = roundtrip(&codec, bytes);
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_ten_megabytes_random() {
        let codec = PayloadCodec::default();
        let mut bytes = vec![0u8; 10 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut bytes);
        roundtrip(&codec, bytes);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let bogus = CallResult { payload: b"definitely not zstd".to_vec(), compressed: true };
        assert!(PayloadCodec::decode(&bogus).is_err());
    }
}
