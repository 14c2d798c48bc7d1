//! Source Contract
//!
//! A [`Source`] is anything that can serve timestamped records for a
//! closed time range: a local log file, a remote chunk store, a
//! replayed network capture. The playback engine only ever talks to
//! `Arc<dyn Source>` so backends can be swapped without touching the
//! caching or playback layers.
//!
//! ## Iteration
//!
//! `message_iterator` returns a pull-based [`RecordCursor`]. Within one
//! cursor, data records arrive in non-decreasing time order; problem
//! records may appear anywhere in the stream. Cursor cleanup happens on
//! drop.
//!
//! The [`ConsumptionHint`] tells the source how the cursor will be
//! drained: `Partial` readers stop early and often (interactive
//! playback), `Full` readers drain the whole range (preloading), which
//! lets a backend pick its fetch strategy.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{DataRecord, Problem, Record};
use crate::time::Time;

/// How a caller intends to consume an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionHint {
    /// The caller may stop reading at any time.
    Partial,
    /// The caller will read the entire requested range.
    Full,
}

/// Arguments to [`Source::message_iterator`].
#[derive(Debug, Clone)]
pub struct IteratorArgs {
    pub topics: Vec<String>,
    /// Inclusive start; defaults to the source start.
    pub start: Option<Time>,
    /// Inclusive end; defaults to the source end.
    pub end: Option<Time>,
    pub hint: ConsumptionHint,
}

/// Arguments to [`Source::get_backfill_messages`].
#[derive(Debug, Clone)]
pub struct BackfillArgs {
    pub topics: Vec<String>,
    /// Backfill resolves the latest record at or before this time.
    pub time: Time,
}

/// A topic advertised by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub schema_name: Option<String>,
}

/// Per-topic statistics reported at initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub message_count: u64,
    pub first_time: Option<Time>,
    pub last_time: Option<Time>,
}

/// The result of [`Source::initialize`].
#[derive(Debug, Clone)]
pub struct Initialization {
    /// Inclusive time bounds of the log.
    pub start: Time,
    pub end: Time,
    pub topics: Vec<TopicInfo>,
    pub topic_stats: HashMap<String, TopicStats>,
    /// Non-fatal problems discovered while opening the source.
    pub problems: Vec<Problem>,
}

/// Pull-based async record stream. `next` returns `Ok(None)` when the
/// requested range is exhausted.
#[async_trait]
pub trait RecordCursor: Send {
    async fn next(&mut self) -> Result<Option<Record>>;
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Opens the source and reports its bounds and topics. Must be
    /// called before any other operation.
    async fn initialize(&self) -> Result<Initialization>;

    /// Streams records for the requested topics and range.
    fn message_iterator(&self, args: IteratorArgs) -> Box<dyn RecordCursor>;

    /// For each requested topic, the latest record at or before
    /// `args.time`, sorted by time (stable for equal timestamps).
    async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<DataRecord>>;
}
