//! # logplay-player
//!
//! A time-indexed playback engine for timestamped logs. Point it at
//! anything implementing [`Source`](logplay_core::Source) and it plays
//! the log back at wall-clock speed with seeking, pausing, and topic
//! subscriptions, while two caching layers hide source latency:
//!
//! ```text
//!  Source ──> RangeCache ──> ReadAheadBuffer ──> PlaybackController ──> snapshots
//!     │                                               ▲
//!     └────────────> BlockPreloader ──────────────────┘
//! ```
//!
//! - [`RangeCache`] remembers streamed ranges as time-contiguous
//!   blocks under a byte budget, so scrubbing back never re-reads.
//! - [`ReadAheadBuffer`] keeps a producer task a bounded time horizon
//!   ahead of the playback position.
//! - [`BlockPreloader`] sweeps the whole log into time buckets,
//!   prioritized around the active position.
//! - [`PlaybackController`] runs the playback state machine and emits
//!   [`PlayerSnapshot`]s to a listener channel.

pub mod config;
pub mod controller;
pub mod preloader;
pub mod range_cache;
pub mod read_ahead;
pub mod snapshot;

pub use config::{CacheConfig, PlayerConfig, PreloadConfig, ReadAheadConfig};
pub use controller::PlaybackController;
pub use logplay_core::{Error, Result};
pub use preloader::{BlockPreloader, PreloadProgress, TimeBucket};
pub use range_cache::{CacheCursor, RangeCache};
pub use read_ahead::{ReadAheadBuffer, ReadAheadIterator};
pub use snapshot::{PlayerSnapshot, Presence, Progress};
