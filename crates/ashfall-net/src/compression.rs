//! Conditional zstd compression for frame payloads.
//!
//! Payloads below [`CompressionConfig::min_size`] are sent as-is. Larger ones
//! are compressed and the result is kept only when it beats
//! [`CompressionConfig::ratio`]. Small-to-medium payloads use a
//! fast level; everything above [`CompressionConfig::fast_threshold`] uses
//! the configured level.

use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use zstd::bulk::Compressor;

use crate::pool::BufferPool;

/// zstd level used for payloads up to the fast threshold.
pub const FAST_LEVEL: i32 = 1;

/// Compressors and scratch buffers kept per pool.
const MAX_IDLE: usize = 32;

/// Controls when and how payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
    /// Minimum payload size (bytes) before compression is tried. Default: 1024.
    pub min_size: usize,
    /// zstd level for payloads above `fast_threshold`. Default: 3.
    pub level: i32,
    /// Keep compressed output only if `compressed < original * ratio`. Default: 0.9.
    pub ratio: f64,
    /// Payloads up to this size use [`FAST_LEVEL`]. Default: 8 KiB.
    pub fast_threshold: usize,
    /// Upper bound on inflated output. Default: 16 MiB.
    pub max_decompressed_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1024,
            level: 3,
            ratio: 0.9,
            fast_threshold: 8 * 1024,
            max_decompressed_size: 16 * 1024 * 1024,
        }
    }
}

impl From<&ashfall_config::CompressionConfig> for CompressionConfig {
    fn from(c: &ashfall_config::CompressionConfig) -> Self {
        Self {
            enabled: c.enabled,
            min_size: c.min_size,
            level: c.compression_level,
            ratio: c.compression_ratio,
            fast_threshold: c.fast_threshold,
            max_decompressed_size: c.max_decompressed_size,
        }
    }
}

/// Errors that can occur while compressing or inflating a payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// zstd failed to compress.
    #[error("zstd compression failed: {0}")]
    Compress(#[source] std::io::Error),
    /// The payload is not a valid zstd stream.
    #[error("zstd decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    /// The payload inflates past the configured limit.
    #[error("decompressed payload exceeds {limit} bytes")]
    TooLarge {
        /// The configured limit.
        limit: usize,
    },
}

/// Pooled zstd compressors plus scratch space.
pub struct PayloadCompressor {
    config: CompressionConfig,
    fast: Mutex<Vec<Compressor<'static>>>,
    default: Mutex<Vec<Compressor<'static>>>,
    scratch: Mutex<Vec<Vec<u8>>>,
    buffers: Arc<BufferPool>,
}

impl PayloadCompressor {
    pub fn new(config: CompressionConfig, buffers: Arc<BufferPool>) -> Self {
        Self {
            config,
            fast: Mutex::new(Vec::new()),
            default: Mutex::new(Vec::new()),
            scratch: Mutex::new(Vec::new()),
            buffers,
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether `len` bytes are large enough to try compressing.
    pub fn should_compress(&self, len: usize) -> bool {
        self.config.enabled && len >= self.config.min_size
    }

    /// Compress `data` if that is worthwhile.
    ///
    /// Returns `Ok(None)` when the payload should go out uncompressed, either
    /// because it is too small or because compression did not save enough.
    /// The returned buffer comes from the buffer pool.
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        if !self.should_compress(data.len()) {
            return Ok(None);
        }

        let (pool, level) = if data.len() <= self.config.fast_threshold {
            (&self.fast, FAST_LEVEL)
        } else {
            (&self.default, self.config.level)
        };

        let mut compressor = match pool.lock().pop() {
            Some(compressor) => compressor,
            None => Compressor::new(level).map_err(CompressionError::Compress)?,
        };
        let mut scratch = self.scratch.lock().pop().unwrap_or_default();
        scratch.clear();
        scratch.reserve(zstd::zstd_safe::compress_bound(data.len()));

        let result = compressor.compress_to_buffer(data, &mut scratch);
        release(pool, compressor);

        let out = match result {
            Ok(written) if (written as f64) < data.len() as f64 * self.config.ratio => {
                let mut out = self.buffers.get_empty(written);
                out.extend_from_slice(&scratch[..written]);
                Ok(Some(out))
            }
            Ok(_) => Ok(None),
            Err(e) => Err(CompressionError::Compress(e)),
        };
        release(&self.scratch, scratch);
        out
    }

    /// Inflate a compressed payload, refusing output larger than
    /// [`CompressionConfig::max_decompressed_size`].
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let limit = self.config.max_decompressed_size;
        let decoder =
            zstd::stream::read::Decoder::with_buffer(data).map_err(CompressionError::Decompress)?;

        let mut out = self
            .buffers
            .get_empty(data.len().saturating_mul(4).min(limit));
        if let Err(e) = decoder.take(limit as u64 + 1).read_to_end(&mut out) {
            self.buffers.put(out);
            return Err(CompressionError::Decompress(e));
        }
        if out.len() > limit {
            self.buffers.put(out);
            return Err(CompressionError::TooLarge { limit });
        }
        Ok(out)
    }

    /// Idle compressors held for the fast and default levels.
    pub fn idle_compressors(&self) -> (usize, usize) {
        (self.fast.lock().len(), self.default.lock().len())
    }
}

fn release<T>(pool: &Mutex<Vec<T>>, item: T) {
    let mut idle = pool.lock();
    if idle.len() < MAX_IDLE {
        idle.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn compressor(config: CompressionConfig) -> PayloadCompressor {
        PayloadCompressor::new(config, Arc::new(BufferPool::new()))
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rng().fill(&mut data[..]);
        data
    }

    #[test]
    fn test_small_message_is_not_compressed() {
        let c = compressor(CompressionConfig::default());
        assert!(c.compress(&[7u8; 1023]).unwrap().is_none());
    }

    #[test]
    fn test_large_message_is_compressed() {
        let c = compressor(CompressionConfig::default());
        let data = vec![42u8; 4096];
        let compressed = c.compress(&data).unwrap().expect("should compress");
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_is_sent_raw() {
        let c = compressor(CompressionConfig::default());
        assert!(c.compress(&random_bytes(4096)).unwrap().is_none());
    }

    #[test]
    fn test_compression_disabled() {
        let c = compressor(CompressionConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(c.compress(&vec![0u8; 64 * 1024]).unwrap().is_none());
    }

    #[test]
    fn test_fast_and_default_levels_use_separate_pools() {
        let c = compressor(CompressionConfig::default());
        let small = vec![1u8; 2000];
        let large = vec![2u8; 20_000];

        let a = c.compress(&small).unwrap().unwrap();
        let b = c.compress(&large).unwrap().unwrap();
        assert_eq!(c.idle_compressors(), (1, 1));
        assert_eq!(c.decompress(&a).unwrap(), small);
        assert_eq!(c.decompress(&b).unwrap(), large);

        // Reused, not recreated.
        c.compress(&small).unwrap();
        assert_eq!(c.idle_compressors(), (1, 1));
    }

    #[test]
    fn test_chunky_data_compresses_well() {
        let c = compressor(CompressionConfig::default());
        let mut chunk = Vec::with_capacity(32_768);
        chunk.extend(std::iter::repeat_n(0x00u8, 16_384));
        chunk.extend(std::iter::repeat_n(0x01u8, 8_192));
        chunk.extend(std::iter::repeat_n(0x02u8, 8_192));

        let compressed = c.compress(&chunk).unwrap().unwrap();
        assert!(compressed.len() * 2 < chunk.len());
    }

    #[test]
    fn test_decompression_limit_enforced() {
        let c = compressor(CompressionConfig {
            max_decompressed_size: 1024 * 1024,
            ..Default::default()
        });
        let bomb = zstd::bulk::compress(&vec![0u8; 2 * 1024 * 1024], 3).unwrap();
        assert!(matches!(
            c.decompress(&bomb),
            Err(CompressionError::TooLarge { limit: 1_048_576 })
        ));
    }

    #[test]
    fn test_garbage_fails_to_decompress() {
        let c = compressor(CompressionConfig::default());
        assert!(matches!(
            c.decompress(b"definitely not zstd"),
            Err(CompressionError::Decompress(_))
        ));
    }

    #[test]
    fn test_from_config_section() {
        let section = ashfall_config::CompressionConfig {
            compression_level: 9,
            min_size: 10,
            ..Default::default()
        };
        let config = CompressionConfig::from(&section);
        assert_eq!(config.level, 9);
        assert_eq!(config.min_size, 10);
        assert_eq!(config.fast_threshold, 8192);
    }
}
