//! Optional body compression inside the sealed envelope.
//!
//! The envelope head carries a one-byte flag: 0 = stored, 1 = LZ4, 2 = Zstd.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

/// Flag value for a stored (uncompressed) body
pub const FLAG_STORED: u8 = 0;

impl CompressionKind {
    pub fn flag(self) -> u8 {
        match self {
            CompressionKind::Lz4 => 1,
            CompressionKind::Zstd => 2,
        }
    }

    /// Kind for an envelope flag; `Ok(None)` for a stored body
    pub fn from_flag(flag: u8) -> Result<Option<Self>> {
        match flag {
            FLAG_STORED => Ok(None),
            1 => Ok(Some(CompressionKind::Lz4)),
            2 => Ok(Some(CompressionKind::Zstd)),
            other => Err(ProtocolError::MalformedEncoding(format!(
                "Unknown compression flag {other}"
            ))),
        }
    }
}

/// Minimum entropy threshold for compression (0.0-8.0 bits per byte)
const MIN_ENTROPY_THRESHOLD: f64 = 4.0;

/// Shannon entropy of data in bits per byte
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = f64::from(count) / len;
            -p * p.log2()
        })
        .sum()
}

/// Whether a body is big enough and regular enough to be worth compressing
fn should_compress(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }
    if data.len() < 1024 {
        return true;
    }
    // Sample the head; encrypted or already packed payloads score high
    let sample = &data[..data.len().min(512)];
    calculate_entropy(sample) < MIN_ENTROPY_THRESHOLD
}

/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompress, refusing outputs larger than `limit`.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` on corrupt input or an oversized result
pub fn decompress(data: &[u8], kind: CompressionKind, limit: usize) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            // Check the prepended size before lz4_flex allocates for it
            let claimed = data
                .get(..4)
                .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]) as usize)
                .ok_or(ProtocolError::DecompressionFailure)?;
            if claimed > limit {
                return Err(ProtocolError::DecompressionFailure);
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            use std::io::Read;

            let decoder = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            let mut out = Vec::new();
            decoder
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            if out.len() > limit {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(out)
        }
    }
}

/// Compress when configured and worthwhile. Returns the body and its envelope flag.
pub fn compress_body(
    data: &[u8],
    kind: Option<CompressionKind>,
    threshold_bytes: usize,
) -> Result<(Vec<u8>, u8)> {
    if let Some(kind) = kind {
        if should_compress(data, threshold_bytes) {
            let compressed = compress(data, kind)?;
            if compressed.len() < data.len() {
                return Ok((compressed, kind.flag()));
            }
        }
    }
    Ok((data.to_vec(), FLAG_STORED))
}

/// Undo [`compress_body`] according to the envelope flag
pub fn decompress_body(data: &[u8], flag: u8, limit: usize) -> Result<Vec<u8>> {
    match CompressionKind::from_flag(flag)? {
        Some(kind) => decompress(data, kind, limit),
        None => Ok(data.to_vec()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    #[test]
    fn test_roundtrip_both_kinds() {
        let original = b"Hello, World! This is a test of body compression.".repeat(4);
        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let compressed = compress(&original, kind).unwrap();
            assert_eq!(decompress(&compressed, kind, LIMIT).unwrap(), original);
        }
    }

    #[test]
    fn test_lz4_claimed_size_over_limit() {
        // Claims 0xbbbb602b bytes of output
        let malicious = vec![0x2b, 0x60, 0xbb, 0xbb];
        assert!(decompress(&malicious, CompressionKind::Lz4, LIMIT).is_err());
        assert!(decompress(&[0x2b, 0x60], CompressionKind::Lz4, LIMIT).is_err());
    }

    #[test]
    fn test_zstd_output_over_limit() {
        let big = vec![0u8; 4096];
        let compressed = compress(&big, CompressionKind::Zstd).unwrap();
        assert!(decompress(&compressed, CompressionKind::Zstd, 1024).is_err());
    }

    #[test]
    fn test_body_below_threshold_is_stored() {
        let (out, flag) = compress_body(b"tiny", Some(CompressionKind::Lz4), 512).unwrap();
        assert_eq!(flag, FLAG_STORED);
        assert_eq!(decompress_body(&out, flag, LIMIT).unwrap(), b"tiny");
    }

    #[test]
    fn test_low_entropy_body_is_compressed() {
        let data = vec![0u8; 2048];
        let (out, flag) = compress_body(&data, Some(CompressionKind::Zstd), 512).unwrap();
        assert_eq!(flag, CompressionKind::Zstd.flag());
        assert!(out.len() < data.len());
        assert_eq!(decompress_body(&out, flag, LIMIT).unwrap(), data);
    }

    #[test]
    fn test_high_entropy_body_is_stored() {
        let data: Vec<u8> = (0..=255).cycle().take(2048).collect();
        let (out, flag) = compress_body(&data, Some(CompressionKind::Lz4), 512).unwrap();
        assert_eq!(flag, FLAG_STORED);
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn test_entropy_calculation() {
        assert!(calculate_entropy(&[0u8; 100]) < 0.1);
        let spread: Vec<u8> = (0..=255).cycle().take(1000).collect();
        assert!(calculate_entropy(&spread) > 7.0);
    }

    #[test]
    fn test_unknown_flag() {
        assert!(decompress_body(b"x", 9, LIMIT).is_err());
    }
}
