//! Block compression (C15 ambient concern)
//!
//! The wire protocol's `compression: i32` field (§6: negative = LZ4 fast at
//! `-compression`, zero = default, positive = Zstd at that level) is produced
//! by [`CompressionAlgorithm::to_wire`] / read back by
//! [`CompressionAlgorithm::from_wire`]. [`CompressionManager`] picks an
//! algorithm, compresses through plain functions (no per-algorithm object —
//! every algorithm here is a pure `&[u8] -> Vec<u8>` transform, so there is
//! nothing a trait would buy beyond indirection) and folds the result
//! straight into that wire encoding via [`CompressionManager::to_wire_payload`].

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Compression algorithm identifier, serialized as part of block metadata
/// and the wire protocol's `compression` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
    Snappy,
}

impl CompressionAlgorithm {
    /// Map to §6's wire encoding. Snappy has no wire representation (it is
    /// an internal-cache-only algorithm); callers must not ship it over the
    /// network without recompressing.
    pub fn to_wire(self, level: i32) -> i32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => -level.max(1),
            CompressionAlgorithm::Zstd => level.max(1),
            CompressionAlgorithm::Snappy => 0,
        }
    }

    pub fn from_wire(value: i32) -> (Self, i32) {
        match value.cmp(&0) {
            std::cmp::Ordering::Equal => (CompressionAlgorithm::None, 0),
            std::cmp::Ordering::Less => (CompressionAlgorithm::Lz4, -value),
            std::cmp::Ordering::Greater => (CompressionAlgorithm::Zstd, value),
        }
    }
}

/// Compress `data` with `algorithm` at `level` (ignored by `None`/`Snappy`).
fn compress_bytes(algorithm: CompressionAlgorithm, data: &[u8], level: i32) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => {
            lz4::block::compress(data, Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level.max(1))), true)
                .map_err(|e| Error::Internal(format!("LZ4 compression failed: {e}")))
        }
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(data, level).map_err(|e| Error::Internal(format!("Zstd compression failed: {e}")))
        }
        CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Internal(format!("Snappy compression failed: {e}"))),
    }
}

fn decompress_bytes(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => {
            lz4::block::decompress(data, None).map_err(|e| Error::Internal(format!("LZ4 decompression failed: {e}")))
        }
        CompressionAlgorithm::Zstd => {
            zstd::decode_all(data).map_err(|e| Error::Internal(format!("Zstd decompression failed: {e}")))
        }
        CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Internal(format!("Snappy decompression failed: {e}"))),
    }
}

/// Configuration for compression.
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Default algorithm for [`CompressionManager::compress`]'s automatic pick.
    pub default_algorithm: CompressionAlgorithm,
    /// Minimum size to compress; smaller blocks ship uncompressed since the
    /// framing overhead would eat the saving.
    pub min_size_bytes: u64,
    /// Compression level (algorithm-specific; ignored by `None`/`Snappy`).
    pub level: i32,
    /// Whether to fall back to uncompressed on a compressor error rather
    /// than propagating it.
    pub fallback_on_failure: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            level: 3,
            fallback_on_failure: true,
        }
    }
}

/// Picks an algorithm, compresses, and folds failures back to uncompressed
/// when `fallback_on_failure` allows it. `Copy` since it is just a
/// [`CompressionConfig`] — cheap to hand to a thread-pool closure by value
/// instead of borrowing across an `await`.
#[derive(Debug, Clone, Copy)]
pub struct CompressionManager {
    config: CompressionConfig,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress using the configured default algorithm, skipping anything
    /// under `min_size_bytes`.
    ///
    /// Returns `(compressed_data, algorithm_used)`.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if (data.len() as u64) < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }
        self.compress_with(data, self.config.default_algorithm).unwrap_or_else(|e| {
            tracing::warn!("compression failed, using uncompressed: {e}");
            (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
        })
    }

    /// Compress with a specific algorithm, bypassing the size threshold.
    /// Falls back to `None` if the result isn't actually smaller, or if
    /// compression errors and `fallback_on_failure` is set.
    pub fn compress_with(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<(Bytes, CompressionAlgorithm)> {
        if algorithm == CompressionAlgorithm::None {
            return Ok((Bytes::copy_from_slice(data), CompressionAlgorithm::None));
        }
        match compress_bytes(algorithm, data, self.config.level) {
            Ok(compressed) if compressed.len() < data.len() => Ok((Bytes::from(compressed), algorithm)),
            Ok(_) => Ok((Bytes::copy_from_slice(data), CompressionAlgorithm::None)),
            Err(e) if self.config.fallback_on_failure => {
                tracing::warn!("compression with {algorithm:?} failed, using uncompressed: {e}");
                Ok((Bytes::copy_from_slice(data), CompressionAlgorithm::None))
            }
            Err(e) => Err(e),
        }
    }

    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        decompress_bytes(algorithm, data).map(Bytes::from)
    }

    /// Compress with the default algorithm and hand back the §6 wire
    /// `compression` field directly, so a caller building a `SendBlock`
    /// frame never has to re-derive it from the algorithm and level
    /// separately.
    pub fn to_wire_payload(&self, data: &[u8]) -> (Bytes, i32) {
        let (payload, algorithm) = self.compress(data);
        (payload, algorithm.to_wire(self.config.level))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
