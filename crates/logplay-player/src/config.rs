//! Player configuration.
//!
//! All knobs default to values tuned for interactive playback of
//! multi-gigabyte logs; they are serde-deserializable so an embedding
//! application can load them from its own config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-through cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total byte budget across all cache blocks.
    #[serde(default = "default_cache_total_bytes")]
    pub max_total_bytes: usize,
    /// A block is closed once it grows past this size.
    #[serde(default = "default_cache_block_bytes")]
    pub max_block_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_total_bytes: default_cache_total_bytes(),
            max_block_bytes: default_cache_block_bytes(),
        }
    }
}

/// Read-ahead buffering horizons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAheadConfig {
    /// How far past the consumer's read head the producer buffers.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: Duration,
    /// The consumer is not woken until at least this much is buffered.
    /// Must not exceed `read_ahead`.
    #[serde(default = "default_min_read_ahead")]
    pub min_read_ahead: Duration,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        ReadAheadConfig {
            read_ahead: default_read_ahead(),
            min_read_ahead: default_min_read_ahead(),
        }
    }
}

/// Whole-log preloading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Byte budget for preloaded buckets.
    #[serde(default = "default_preload_bytes")]
    pub max_total_bytes: usize,
    /// Upper bound on the number of time buckets.
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    /// Lower bound on a single bucket's duration.
    #[serde(default = "default_min_bucket_duration")]
    pub min_bucket_duration: Duration,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        PreloadConfig {
            max_total_bytes: default_preload_bytes(),
            max_buckets: default_max_buckets(),
            min_bucket_duration: default_min_bucket_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub read_ahead: ReadAheadConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
    /// Disable to skip whole-log preloading entirely.
    #[serde(default = "default_true")]
    pub enable_preload: bool,
    /// How far past the log start the first frame reads.
    #[serde(default = "default_prime_lookahead")]
    pub prime_lookahead: Duration,
    /// Delay between metadata load and playback start, giving
    /// subscribers time to attach.
    #[serde(default = "default_start_delay")]
    pub start_delay: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            cache: CacheConfig::default(),
            read_ahead: ReadAheadConfig::default(),
            preload: PreloadConfig::default(),
            enable_preload: default_true(),
            prime_lookahead: default_prime_lookahead(),
            start_delay: default_start_delay(),
        }
    }
}

fn default_cache_total_bytes() -> usize {
    1024 * 1024 * 1024
}

fn default_cache_block_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_read_ahead() -> Duration {
    Duration::from_secs(10)
}

fn default_min_read_ahead() -> Duration {
    Duration::from_secs(1)
}

fn default_preload_bytes() -> usize {
    1_000_000_000
}

fn default_max_buckets() -> usize {
    400
}

fn default_min_bucket_duration() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_prime_lookahead() -> Duration {
    Duration::from_millis(99)
}

fn default_start_delay() -> Duration {
    Duration::from_millis(100)
}
