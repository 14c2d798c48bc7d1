//! # logplay-core
//!
//! Core types for the logplay playback engine: integer-nanosecond
//! timestamps, log records, the abstract [`Source`] contract, and the
//! small utilities the caching and playback layers share.
//!
//! The engine itself lives in `logplay-player`; this crate holds
//! everything a source backend needs to implement, so backends do not
//! depend on the player.

pub mod cursor;
pub mod error;
pub mod memory;
pub mod problems;
pub mod ranges;
pub mod record;
pub mod source;
pub mod time;

pub use cursor::BatchCursor;
pub use error::{Error, Result};
pub use memory::MemorySource;
pub use problems::ProblemStore;
pub use ranges::{contiguous_fraction_ranges, FractionRange};
pub use record::{DataRecord, Problem, Record, Severity};
pub use source::{
    BackfillArgs, ConsumptionHint, Initialization, IteratorArgs, RecordCursor, Source, TopicInfo,
    TopicStats,
};
pub use time::Time;
