//! Payload Compression and Wire Envelope
//!
//! Payloads written to the distributed tier use the envelope
//!
//! ```text
//! [optional 4-byte marker "LZ4\0"][payload]
//! ```
//!
//! Packed values larger than the compression threshold are LZ4 block
//! compressed (size-prefixed) and carry the marker; smaller ones are stored
//! as-is.
//!
//! # Example
//!
//! ```
//! use fincache::cache::compression::PayloadCodec;
//!
//! let codec = PayloadCodec::new(16);
//! let data = vec![7u8; 64];
//!
//! let wire = codec.encode(&data).unwrap();
//! assert!(PayloadCodec::is_compressed(&wire));
//! assert_eq!(codec.decode(&wire).unwrap(), data);
//! ```

use bytes::Bytes;

use crate::error::{Error, Result};

/// Marker prefixed to compressed payloads
pub const COMPRESSION_MARKER: [u8; 4] = *b"LZ4\0";

/// Default compression threshold in bytes
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

// =============================================================================
// Compressor Trait
// =============================================================================

/// Block compression algorithm
pub trait Compressor: Send + Sync {
    /// Algorithm name for diagnostics
    fn name(&self) -> &'static str;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 block compressor (fast mode, size-prefixed blocks)
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(
            |e| Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            },
        )
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Payload Codec
// =============================================================================

/// Encodes packed values into the distributed-tier wire envelope
pub struct PayloadCodec {
    threshold: usize,
    compressor: Box<dyn Compressor>,
}

impl PayloadCodec {
    /// Create a codec with the LZ4 compressor
    pub fn new(threshold: usize) -> Self {
        Self::with_compressor(threshold, Box::new(Lz4Compressor))
    }

    pub fn with_compressor(threshold: usize, compressor: Box<dyn Compressor>) -> Self {
        Self {
            threshold,
            compressor,
        }
    }

    /// Compression threshold in bytes
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Wrap a packed value for the wire.
    ///
    /// Payloads that happen to begin with the marker are always compressed so
    /// that an unmarked payload can never be mistaken for a compressed one.
    pub fn encode(&self, packed: &[u8]) -> Result<Vec<u8>> {
        if packed.len() <= self.threshold && !packed.starts_with(&COMPRESSION_MARKER) {
            return Ok(packed.to_vec());
        }

        let compressed = self.compressor.compress(packed)?;
        let mut wire = Vec::with_capacity(COMPRESSION_MARKER.len() + compressed.len());
        wire.extend_from_slice(&COMPRESSION_MARKER);
        wire.extend_from_slice(&compressed);
        Ok(wire)
    }

    /// Unwrap a wire payload back into the packed value
    pub fn decode(&self, wire: &[u8]) -> Result<Bytes> {
        match wire.strip_prefix(&COMPRESSION_MARKER) {
            Some(body) => Ok(Bytes::from(self.compressor.decompress(body)?)),
            None => Ok(Bytes::copy_from_slice(wire)),
        }
    }

    /// Check whether a wire payload carries the compression marker
    #[inline]
    pub fn is_compressed(wire: &[u8]) -> bool {
        wire.starts_with(&COMPRESSION_MARKER)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("threshold", &self.threshold)
            .field("algorithm", &self.compressor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor;

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len() + 4);

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_threshold_boundary() {
        let codec = PayloadCodec::new(DEFAULT_COMPRESSION_THRESHOLD);

        let above = vec![b'x'; DEFAULT_COMPRESSION_THRESHOLD + 1];
        let below = vec![b'x'; DEFAULT_COMPRESSION_THRESHOLD - 1];
        let exact = vec![b'x'; DEFAULT_COMPRESSION_THRESHOLD];

        assert!(PayloadCodec::is_compressed(&codec.encode(&above).unwrap()));
        assert!(!PayloadCodec::is_compressed(&codec.encode(&below).unwrap()));
        assert!(!PayloadCodec::is_compressed(&codec.encode(&exact).unwrap()));
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let codec = PayloadCodec::default();
        let wire = codec.encode(b"tiny").unwrap();
        assert_eq!(wire, b"tiny");
        assert_eq!(codec.decode(&wire).unwrap().as_ref(), b"tiny");
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let codec = PayloadCodec::new(32);
        let wire = codec.encode(TEST_DATA).unwrap();
        assert!(PayloadCodec::is_compressed(&wire));
        assert_eq!(codec.decode(&wire).unwrap().as_ref(), TEST_DATA);
    }

    #[test]
    fn test_marker_lookalike_is_always_compressed() {
        let codec = PayloadCodec::default();
        let mut lookalike = COMPRESSION_MARKER.to_vec();
        lookalike.extend_from_slice(b"raw");

        let wire = codec.encode(&lookalike).unwrap();
        assert!(PayloadCodec::is_compressed(&wire));
        assert_eq!(codec.decode(&wire).unwrap().as_ref(), lookalike.as_slice());
    }

    #[test]
    fn test_corrupt_compressed_payload() {
        let codec = PayloadCodec::default();
        let mut wire = COMPRESSION_MARKER.to_vec();
        // Claims 100 decompressed bytes, body is garbage
        wire.extend_from_slice(&[100, 0, 0, 0, 0xff, 0xff, 0xff]);

        let err = codec.decode(&wire).unwrap_err();
        assert!(matches!(err, Error::DecompressionFailed { .. }));
    }
}
