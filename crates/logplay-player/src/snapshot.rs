//! Emitted player state.
//!
//! The controller pushes an immutable [`PlayerSnapshot`] to its
//! listener after every meaningful transition: one per playback tick,
//! one per seek resolution, one per load-progress change. Records are
//! drained into the snapshot, so each data record is delivered exactly
//! once.

use logplay_core::{DataRecord, FractionRange, Problem, Time, TopicInfo};

/// Coarse liveness of the player, for a UI to badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Metadata is still loading.
    Initializing,
    /// A read is taking long enough that playback is visibly stalled.
    Buffering,
    Present,
    Error,
}

/// Load progress across the two caching layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Ranges covered by the interactive read-through cache.
    pub buffered_ranges: Vec<FractionRange>,
    /// Ranges fully preloaded into time buckets.
    pub preloaded_ranges: Vec<FractionRange>,
    pub buffered_bytes: usize,
    pub preloaded_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub presence: Presence,
    pub start: Option<Time>,
    pub end: Option<Time>,
    pub current_time: Option<Time>,
    pub is_playing: bool,
    pub speed: f64,
    /// Records that became current since the previous snapshot.
    pub records: Vec<DataRecord>,
    pub progress: Progress,
    pub problems: Vec<Problem>,
    pub topics: Vec<TopicInfo>,
}
