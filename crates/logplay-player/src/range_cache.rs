//! Read-Through Range Cache
//!
//! [`RangeCache`] wraps a [`Source`] and remembers everything it
//! streams as time-contiguous blocks, so that re-reading a range the
//! user already played (scrubbing backwards, looping) never touches
//! the source again.
//!
//! ```text
//!  initialized range  [start                                   end]
//!  cached blocks      [b1       ][b2    ]         [b3       ]
//!  read head                         ▲
//!                    inside b2: serve items ──────┐
//!                    past b2.end: read the source │
//!                    for the gap, up to b3.start - 1ns
//! ```
//!
//! ## How It Works
//!
//! A cursor walks a read head through the requested range. At each
//! position it either serves items out of the block covering the head,
//! or opens a source read for the uncovered gap up to the next block
//! (or the range end). Records streamed from the source are staged in
//! a pending list and only folded into the open block once a later
//! timestamp proves the block's coverage: when a record at time `t`
//! arrives, everything pending is flushed and the block's end becomes
//! `t - 1ns`. Times are inclusive, so this keeps equal-timestamp runs
//! intact and makes adjacent blocks meet exactly at `end + 1ns ==
//! start`.
//!
//! Blocks are closed once they exceed the per-block size limit and
//! evicted oldest-access-first when the total budget is exceeded, at
//! most one per admitted record. Evicting the block currently being
//! written is a logic error and fails the cursor.
//!
//! Problem records carry no timestamp; they are tagged with the last
//! known time of the read so they replay at a stable position.

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::debug;

use logplay_core::{
    BackfillArgs, ConsumptionHint, DataRecord, Error, FractionRange, Initialization, IteratorArgs,
    Record, RecordCursor, Result, Source, Time,
};

use crate::config::CacheConfig;

struct CacheBlock {
    id: u64,
    /// Inclusive covered range.
    start: Time,
    end: Time,
    /// Time-tagged records, sorted by tag, emission order preserved.
    items: Vec<(Time, Record)>,
    size_bytes: usize,
    /// Monotonic access counter, not wall clock.
    last_access: u64,
}

#[derive(Default)]
struct CacheState {
    topics: Vec<String>,
    blocks: Vec<CacheBlock>,
    total_bytes: usize,
    loaded: Vec<FractionRange>,
    access_clock: u64,
    next_block_id: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    fn alloc_block_id(&mut self) -> u64 {
        self.next_block_id += 1;
        self.next_block_id
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    fn block_index_containing(&self, time: Time) -> Option<usize> {
        self.blocks.iter().position(|b| b.start <= time && time <= b.end)
    }

    /// Start of the first block strictly after `time`.
    fn next_block_start_after(&self, time: Time) -> Option<Time> {
        self.blocks.iter().map(|b| b.start).filter(|s| *s > time).min()
    }

    fn insert_block_sorted(&mut self, block: CacheBlock) -> usize {
        let idx = self.blocks.partition_point(|b| b.start < block.start);
        self.blocks.insert(idx, block);
        idx
    }

    fn recompute_loaded(&mut self, bounds: (Time, Time)) {
        let (start, end) = bounds;
        let total = end.nanos_since(start);
        if total == 0 {
            // A zero-duration log is fully covered by any block.
            self.loaded = if self.blocks.is_empty() {
                vec![FractionRange::new(0.0, 0.0)]
            } else {
                vec![FractionRange::new(0.0, 1.0)]
            };
            return;
        }
        if self.blocks.is_empty() {
            self.loaded = vec![FractionRange::new(0.0, 0.0)];
            return;
        }
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for block in &self.blocks {
            let b = (block.start.nanos_since(start), block.end.nanos_since(start));
            match merged.last_mut() {
                // Blocks meeting exactly at end + 1ns are one range.
                Some(prev) if prev.1.saturating_add(1) >= b.0 => prev.1 = prev.1.max(b.1),
                _ => merged.push(b),
            }
        }
        self.loaded = merged
            .into_iter()
            .map(|(s, e)| {
                FractionRange::new(s as f64 / total as f64, (e as f64 / total as f64).min(1.0))
            })
            .collect();
    }

    /// Evicts the least recently accessed block if `incoming` further
    /// bytes would exceed `cap`. At most one block per call; evicting
    /// the block being written fails.
    fn purge_for(&mut self, incoming: usize, cap: usize, active: Option<u64>) -> Result<bool> {
        if self.total_bytes + incoming <= cap {
            return Ok(false);
        }
        let Some(oldest) = self
            .blocks
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.last_access)
            .map(|(i, _)| i)
        else {
            return Ok(false);
        };
        if active.is_some() && Some(self.blocks[oldest].id) == active {
            return Err(Error::invariant("cache eviction reached the block being written"));
        }
        let block = self.blocks.remove(oldest);
        self.total_bytes -= block.size_bytes;
        debug!(
            start = %block.start,
            end = %block.end,
            freed = block.size_bytes,
            "evicted cache block"
        );
        Ok(true)
    }
}

pub struct RangeCache {
    source: Arc<dyn Source>,
    state: Arc<Mutex<CacheState>>,
    init: OnceLock<Initialization>,
    max_total_bytes: usize,
    max_block_bytes: usize,
}

impl RangeCache {
    pub fn new(source: Arc<dyn Source>, config: &CacheConfig) -> Self {
        RangeCache {
            source,
            state: Arc::new(Mutex::new(CacheState::default())),
            init: OnceLock::new(),
            max_total_bytes: config.max_total_bytes,
            max_block_bytes: config.max_block_bytes,
        }
    }

    pub async fn initialize(&self) -> Result<Initialization> {
        let init = self.source.initialize().await?;
        let _ = self.init.set(init.clone());
        Ok(init)
    }

    pub fn initialization(&self) -> Option<&Initialization> {
        self.init.get()
    }

    /// Opens a cursor over `[args.start, args.end]`. Changing the topic
    /// set drops every cached block: partially-filtered blocks would
    /// serve incomplete ranges as if they were complete.
    pub async fn iterate(&self, args: IteratorArgs) -> Result<CacheCursor> {
        let init = self.init.get().ok_or(Error::Uninitialized)?;
        let bounds = (init.start, init.end);

        let mut topics = args.topics.clone();
        topics.sort();
        topics.dedup();

        let mut state = self.state.lock().await;
        if state.topics != topics {
            debug!(topics = topics.len(), "topic set changed, purging cache");
            state.topics = topics.clone();
            state.blocks.clear();
            state.total_bytes = 0;
            state.recompute_loaded(bounds);
        }
        drop(state);

        let read_head = args.start.unwrap_or(init.start).max(init.start);
        let max_end = args.end.unwrap_or(init.end).min(init.end);
        Ok(CacheCursor {
            source: self.source.clone(),
            state: self.state.clone(),
            bounds,
            topics,
            hint: args.hint,
            read_head,
            max_end,
            max_total_bytes: self.max_total_bytes,
            max_block_bytes: self.max_block_bytes,
            mode: Mode::Scan,
            done: false,
        })
    }

    /// Latest record per topic at or before `args.time`. Served from
    /// cached blocks when the target is covered, walking backwards
    /// across blocks that meet exactly; anything not resolvable from
    /// the cache falls back to the source.
    pub async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<DataRecord>> {
        if self.init.get().is_none() {
            return Err(Error::Uninitialized);
        }

        let mut needed: Vec<String> = args.topics.clone();
        let mut out: Vec<DataRecord> = Vec::new();
        {
            let state = self.state.lock().await;
            if let Some(mut idx) = state.block_index_containing(args.time) {
                loop {
                    if needed.is_empty() {
                        break;
                    }
                    let block = &state.blocks[idx];
                    // First item strictly after the target; scan backward
                    // from there so the last of an equal-timestamp run wins.
                    let upper = block.items.partition_point(|(t, _)| *t <= args.time);
                    for (_, record) in block.items[..upper].iter().rev() {
                        if let Record::Data(d) = record {
                            if let Some(pos) = needed.iter().position(|t| *t == d.topic) {
                                needed.swap_remove(pos);
                                out.push(d.clone());
                            }
                        }
                    }
                    if idx == 0 {
                        break;
                    }
                    let prev = &state.blocks[idx - 1];
                    if prev.end.saturating_add_nanos(1) != block.start {
                        // Gap: records may exist that the cache never saw.
                        break;
                    }
                    idx -= 1;
                }
            }
        }

        if !needed.is_empty() {
            let fallback = self
                .source
                .get_backfill_messages(BackfillArgs { topics: needed, time: args.time })
                .await?;
            out.extend(fallback);
        }
        out.sort_by_key(|d| d.time);
        Ok(out)
    }

    pub async fn loaded_ranges(&self) -> Vec<FractionRange> {
        let state = self.state.lock().await;
        if state.loaded.is_empty() {
            return vec![FractionRange::new(0.0, 0.0)];
        }
        state.loaded.clone()
    }

    pub async fn total_bytes(&self) -> usize {
        self.state.lock().await.total_bytes
    }
}

enum Mode {
    /// Deciding whether the read head is covered by a block.
    Scan,
    /// Serving items out of a cached block.
    Cached { block_id: u64, item_idx: usize },
    /// Streaming a gap from the source into a new block.
    Fill(Box<FillState>),
}

struct FillState {
    cursor: Box<dyn RecordCursor>,
    /// Inclusive end of the source read.
    source_end: Time,
    /// Open block, if any. Blocks close at the size limit.
    block_id: Option<u64>,
    /// Admitted records not yet proven covered by the open block.
    /// Their bytes enter the cache total only on flush, so a dropped
    /// cursor leaves the accounting consistent.
    pending: Vec<(Time, Record)>,
    pending_bytes: usize,
    last_time: Time,
}

pub struct CacheCursor {
    source: Arc<dyn Source>,
    state: Arc<Mutex<CacheState>>,
    bounds: (Time, Time),
    topics: Vec<String>,
    hint: ConsumptionHint,
    read_head: Time,
    max_end: Time,
    max_total_bytes: usize,
    max_block_bytes: usize,
    mode: Mode,
    done: bool,
}

impl CacheCursor {
    pub async fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if self.done {
                return Ok(None);
            }
            match &mut self.mode {
                Mode::Scan => {
                    if self.read_head > self.max_end {
                        self.done = true;
                        return Ok(None);
                    }
                    let mut state = self.state.lock().await;
                    if let Some(idx) = state.block_index_containing(self.read_head) {
                        let block = &state.blocks[idx];
                        if block.items.is_empty() && block.start == block.end {
                            // Transient zero-width block, drop it.
                            state.blocks.remove(idx);
                            state.recompute_loaded(self.bounds);
                            continue;
                        }
                        let item_idx = find_start_index(&block.items, self.read_head);
                        self.mode = Mode::Cached { block_id: block.id, item_idx };
                    } else {
                        let source_start = self.read_head;
                        let source_end = state
                            .next_block_start_after(self.read_head)
                            .map(|s| s.saturating_sub_nanos(1))
                            .unwrap_or(self.max_end)
                            .min(self.max_end);
                        drop(state);
                        if source_start > source_end {
                            return Err(Error::invariant("cache read start is past its end"));
                        }
                        debug!(start = %source_start, end = %source_end, "cache miss, reading source");
                        let cursor = self.source.message_iterator(IteratorArgs {
                            topics: self.topics.clone(),
                            start: Some(source_start),
                            end: Some(source_end),
                            hint: self.hint,
                        });
                        self.mode = Mode::Fill(Box::new(FillState {
                            cursor,
                            source_end,
                            block_id: None,
                            pending: Vec::new(),
                            pending_bytes: 0,
                            last_time: source_start,
                        }));
                    }
                }
                Mode::Cached { block_id, item_idx } => {
                    let mut state = self.state.lock().await;
                    let Some(idx) = state.index_of(*block_id) else {
                        // Evicted under us, rescan from the head.
                        self.mode = Mode::Scan;
                        continue;
                    };
                    match state.blocks[idx].items.get(*item_idx).cloned() {
                        Some((tag, record)) => {
                            if tag > self.max_end {
                                self.done = true;
                                return Ok(None);
                            }
                            let tick = state.tick();
                            state.blocks[idx].last_access = tick;
                            *item_idx += 1;
                            return Ok(Some(record));
                        }
                        None => {
                            self.read_head = state.blocks[idx].end.saturating_add_nanos(1);
                            self.mode = Mode::Scan;
                        }
                    }
                }
                Mode::Fill(fill) => match fill.cursor.next().await {
                    Err(e) => {
                        self.done = true;
                        return Err(e);
                    }
                    Ok(Some(record)) => {
                        let mut state = self.state.lock().await;
                        let block_id = match fill.block_id {
                            Some(id) => id,
                            None => {
                                let tick = state.tick();
                                let id = state.alloc_block_id();
                                state.insert_block_sorted(CacheBlock {
                                    id,
                                    start: self.read_head,
                                    end: self.read_head,
                                    items: Vec::new(),
                                    size_bytes: 0,
                                    last_access: tick,
                                });
                                state.recompute_loaded(self.bounds);
                                fill.block_id = Some(id);
                                id
                            }
                        };

                        if let Record::Data(data) = &record {
                            if data.time > fill.last_time {
                                // A later timestamp proves coverage up to
                                // t - 1ns; flush what was pending.
                                let idx = state.index_of(block_id).ok_or_else(|| {
                                    Error::invariant("open cache block disappeared")
                                })?;
                                let flushed = flush_pending(&mut state.blocks[idx], &mut fill.pending);
                                state.total_bytes += flushed;
                                fill.pending_bytes = 0;
                                state.blocks[idx].end = data.time.saturating_sub_nanos(1);
                                let tick = state.tick();
                                state.blocks[idx].last_access = tick;
                                fill.last_time = data.time;
                                state.recompute_loaded(self.bounds);
                            }
                        }

                        if let Some(idx) = state.index_of(block_id) {
                            if state.blocks[idx].size_bytes >= self.max_block_bytes {
                                self.read_head =
                                    state.blocks[idx].end.saturating_add_nanos(1);
                                fill.block_id = None;
                            }
                        }

                        let size = record.size_bytes();
                        let incoming = fill.pending_bytes + size;
                        if state.purge_for(incoming, self.max_total_bytes, fill.block_id)? {
                            state.recompute_loaded(self.bounds);
                        }
                        fill.pending.push((fill.last_time, record.clone()));
                        fill.pending_bytes += size;
                        return Ok(Some(record));
                    }
                    Ok(None) => {
                        let mut state = self.state.lock().await;
                        match fill.block_id {
                            Some(id) => {
                                let idx = state.index_of(id).ok_or_else(|| {
                                    Error::invariant("open cache block disappeared")
                                })?;
                                let flushed = flush_pending(&mut state.blocks[idx], &mut fill.pending);
                                state.total_bytes += flushed;
                                fill.pending_bytes = 0;
                                state.blocks[idx].end = fill.source_end;
                                let tick = state.tick();
                                state.blocks[idx].last_access = tick;
                            }
                            None => {
                                let tick = state.tick();
                                let id = state.alloc_block_id();
                                let size_bytes = fill.pending_bytes;
                                state.total_bytes += size_bytes;
                                fill.pending_bytes = 0;
                                state.insert_block_sorted(CacheBlock {
                                    id,
                                    start: self.read_head,
                                    end: fill.source_end,
                                    items: std::mem::take(&mut fill.pending),
                                    size_bytes,
                                    last_access: tick,
                                });
                            }
                        }
                        state.recompute_loaded(self.bounds);
                        self.read_head = fill.source_end.saturating_add_nanos(1);
                        self.mode = Mode::Scan;
                    }
                },
            }
        }
    }
}

fn flush_pending(block: &mut CacheBlock, pending: &mut Vec<(Time, Record)>) -> usize {
    let flushed = pending.iter().map(|(_, r)| r.size_bytes()).sum::<usize>();
    block.size_bytes += flushed;
    block.items.append(pending);
    flushed
}

/// First item index at or after `key`. Items are tag-sorted, so this
/// lands on the first of an equal-timestamp run.
fn find_start_index(items: &[(Time, Record)], key: Time) -> usize {
    items.partition_point(|(t, _)| *t < key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use logplay_core::{MemorySource, Problem, Severity};

    fn rec(topic: &str, secs: u64) -> DataRecord {
        sized_rec(topic, Time::from_secs(secs), 100)
    }

    fn sized_rec(topic: &str, time: Time, size_bytes: usize) -> DataRecord {
        DataRecord {
            topic: topic.to_string(),
            time,
            payload: Bytes::from_static(b"x"),
            size_bytes,
        }
    }

    fn args(topics: &[&str], start: Option<Time>, end: Option<Time>) -> IteratorArgs {
        IteratorArgs {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            start,
            end,
            hint: ConsumptionHint::Partial,
        }
    }

    async fn drain(cursor: &mut CacheCursor) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = cursor.next().await.unwrap() {
            out.push(r);
        }
        out
    }

    fn cache_over(source: MemorySource, config: CacheConfig) -> (Arc<MemorySource>, RangeCache) {
        let source = Arc::new(source);
        let cache = RangeCache::new(source.clone(), &config);
        (source, cache)
    }

    #[tokio::test]
    async fn serves_all_source_records_and_reports_full_range() {
        let (_, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/a", 5), rec("/a", 9)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let out = drain(&mut cursor).await;
        assert_eq!(out.len(), 3);
        assert_eq!(cache.loaded_ranges().await, vec![FractionRange::new(0.0, 1.0)]);
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (source, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/a", 5)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let first = drain(&mut cursor).await;
        assert_eq!(source.iterator_calls(), 1);

        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let second = drain(&mut cursor).await;
        assert_eq!(source.iterator_calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn topic_change_purges_cached_ranges() {
        let (source, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/b", 5)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        drain(&mut cursor).await;
        assert_eq!(cache.loaded_ranges().await, vec![FractionRange::new(0.0, 1.0)]);

        let mut cursor = cache.iterate(args(&["/a", "/b"], None, None)).await.unwrap();
        assert_eq!(cache.loaded_ranges().await, vec![FractionRange::new(0.0, 0.0)]);
        let out = drain(&mut cursor).await;
        assert_eq!(out.len(), 2);
        assert_eq!(source.iterator_calls(), 2);
    }

    #[tokio::test]
    async fn respects_end_bound() {
        let (_, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/a", 5), rec("/a", 9)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache
            .iterate(args(&["/a"], None, Some(Time::from_secs(5))))
            .await
            .unwrap();
        let out = drain(&mut cursor).await;
        assert_eq!(out.len(), 2);
        let ranges = cache.loaded_ranges().await;
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].start.abs() < 1e-9);
        assert!((ranges[0].end - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn evicts_oldest_closed_block_under_byte_pressure() {
        let records = (1..=6).map(|s| rec("/a", s)).collect();
        let (_, cache) = cache_over(
            MemorySource::new(Time::from_secs(0), Time::from_secs(10), records),
            CacheConfig { max_total_bytes: 450, max_block_bytes: 199 },
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let out = drain(&mut cursor).await;
        // The cursor still yields everything; only retention suffers.
        assert_eq!(out.len(), 6);
        assert!(cache.total_bytes().await <= 450);
        let ranges = cache.loaded_ranges().await;
        assert_eq!(ranges.len(), 1);
        // The first block (covering the log start) was evicted.
        assert!(ranges[0].start > 0.0);
        assert!((ranges[0].end - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn evicting_the_active_block_is_an_error() {
        let records = (1..=3).map(|s| rec("/a", s)).collect();
        let (_, cache) = cache_over(
            MemorySource::new(Time::from_secs(0), Time::from_secs(10), records),
            CacheConfig { max_total_bytes: 150, max_block_bytes: usize::MAX },
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let mut failed = false;
        loop {
            match cursor.next().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    assert!(matches!(e, Error::Invariant(_)));
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn zero_duration_log_reports_full_coverage() {
        let t = Time::from_secs(5);
        let (_, cache) = cache_over(
            MemorySource::new(t, t, vec![sized_rec("/a", t, 10)]),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let out = drain(&mut cursor).await;
        assert_eq!(out.len(), 1);
        assert_eq!(cache.loaded_ranges().await, vec![FractionRange::new(0.0, 1.0)]);
    }

    #[tokio::test]
    async fn backfill_is_served_from_cache_when_covered() {
        let (source, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/a", 4), rec("/b", 2)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        let mut cursor = cache.iterate(args(&["/a", "/b"], None, None)).await.unwrap();
        drain(&mut cursor).await;

        let out = cache
            .get_backfill_messages(BackfillArgs {
                topics: vec!["/a".into(), "/b".into()],
                time: Time::from_secs(5),
            })
            .await
            .unwrap();
        assert_eq!(source.backfill_calls(), 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, Time::from_secs(2));
        assert_eq!(out[1].time, Time::from_secs(4));
    }

    #[tokio::test]
    async fn backfill_falls_back_for_unresolved_topics() {
        let (source, cache) = cache_over(
            MemorySource::new(
                Time::from_secs(0),
                Time::from_secs(10),
                vec![rec("/a", 1), rec("/b", 2), rec("/a", 7), rec("/b", 7)],
            ),
            CacheConfig::default(),
        );
        cache.initialize().await.unwrap();
        // Cache only [6, 10]; the target sits inside it but /a's and
        // /b's latest records before 8s are at 7s and covered.
        let mut cursor = cache
            .iterate(args(&["/a", "/b"], Some(Time::from_secs(6)), None))
            .await
            .unwrap();
        drain(&mut cursor).await;

        let out = cache
            .get_backfill_messages(BackfillArgs {
                topics: vec!["/a".into(), "/b".into()],
                time: Time::from_secs(8),
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(source.backfill_calls(), 0);

        // A target below the cached block's coverage cannot cross the
        // gap and must fall back to the source.
        let out = cache
            .get_backfill_messages(BackfillArgs {
                topics: vec!["/a".into()],
                time: Time::from_secs(4),
            })
            .await
            .unwrap();
        assert_eq!(source.backfill_calls(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, Time::from_secs(1));
    }

    #[tokio::test]
    async fn problem_records_replay_from_cache() {
        let source = MemorySource::new(
            Time::from_secs(0),
            Time::from_secs(10),
            vec![rec("/a", 1), rec("/a", 5)],
        )
        .with_stream_problem(Time::from_secs(3), Problem::new(Severity::Warn, "decode"));
        let (_, cache) = cache_over(source, CacheConfig::default());
        cache.initialize().await.unwrap();

        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let first = drain(&mut cursor).await;
        assert_eq!(first.iter().filter(|r| matches!(r, Record::Problem(_))).count(), 1);

        let mut cursor = cache.iterate(args(&["/a"], None, None)).await.unwrap();
        let second = drain(&mut cursor).await;
        assert_eq!(first, second);
    }
}
