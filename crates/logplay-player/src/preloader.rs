//! Whole-Log Block Preloader
//!
//! Independently of interactive playback, the preloader sweeps the
//! entire log into fixed-duration time buckets so features that need
//! random access over the whole range (plots, summaries) have the data
//! resident. The sweep is prioritized around the user's position:
//! each pass starts at the bucket one second behind the active time
//! and wraps around the end of the log back to the beginning.
//!
//! ## Passes and spans
//!
//! A pass walks the buckets in that wrapped order and batches
//! consecutive buckets whose missing-topic sets are equal into spans,
//! one source iteration per span. Within a span, arrival order closes
//! buckets front to back; a bucket is committed with explicit empty
//! per-topic entries when no records landed in it, which is what lets
//! progress distinguish "loaded and empty" from "not loaded yet".
//!
//! ## Eviction
//!
//! Each pass seeds an eviction queue with every bucket id in load
//! order reversed, so the buckets that will be reached last are given
//! up first. The bucket currently being filled is removed from the
//! queue while open. When admitting a record would exceed the byte
//! budget, whole buckets are evicted from the queue front; if the
//! queue runs dry the pass records a deduplicated problem and stops.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use logplay_core::{
    contiguous_fraction_ranges, BatchCursor, ConsumptionHint, DataRecord, Error, FractionRange,
    IteratorArgs, Problem, ProblemStore, Record, Result, Severity, Source, Time,
};

use crate::config::PreloadConfig;

const ACTIVE_LOOKBEHIND: Duration = Duration::from_secs(1);
const CACHE_FULL_KEY: &str = "preload-cache-full";

/// Preloaded records for one fixed-duration slice of the log. Topics
/// map to their records within the slice; an entry with an empty list
/// means the slice was loaded and genuinely holds nothing.
#[derive(Debug, Clone, Default)]
pub struct TimeBucket {
    pub records_by_topic: HashMap<String, Vec<DataRecord>>,
    pub size_bytes: usize,
}

/// Snapshot pushed to the progress callback after every bucket commit.
#[derive(Debug, Clone)]
pub struct PreloadProgress {
    /// Fractions of the log where every requested topic is loaded.
    pub fully_loaded_ranges: Vec<FractionRange>,
    pub buckets: Vec<Option<Arc<TimeBucket>>>,
    pub preloaded_bytes: usize,
}

struct PreloadState {
    buckets: Vec<Option<Arc<TimeBucket>>>,
    topics: Vec<String>,
    active_time: Time,
    stopped: bool,
    pass_token: CancellationToken,
    total_bytes: usize,
    /// Bumped on every change that warrants a new pass; the load loop
    /// compares generations when deciding whether to run again.
    generation: u64,
}

pub struct BlockPreloader {
    source: Arc<dyn Source>,
    problems: Arc<ProblemStore>,
    start: Time,
    end: Time,
    bucket_duration_nanos: u64,
    bucket_count: usize,
    max_total_bytes: usize,
    state: Mutex<PreloadState>,
    change: Notify,
}

impl BlockPreloader {
    pub fn new(
        source: Arc<dyn Source>,
        problems: Arc<ProblemStore>,
        start: Time,
        end: Time,
        config: &PreloadConfig,
    ) -> Result<Self> {
        if config.max_buckets == 0 {
            return Err(Error::invariant("preload bucket count must be positive"));
        }
        if end < start {
            return Err(Error::invariant("preload range end precedes start"));
        }
        // Inclusive bounds: a zero-duration log still spans one nanosecond.
        let total = end.nanos_since(start) + 1;
        let min_duration =
            u64::try_from(config.min_bucket_duration.as_nanos()).unwrap_or(u64::MAX).max(1);
        let bucket_duration_nanos = min_duration.max(total.div_ceil(config.max_buckets as u64));
        let bucket_count = usize::try_from(total.div_ceil(bucket_duration_nanos))
            .map_err(|_| Error::invariant("preload bucket count overflow"))?;
        debug!(buckets = bucket_count, duration = bucket_duration_nanos, "bucket layout");
        Ok(BlockPreloader {
            source,
            problems,
            start,
            end,
            bucket_duration_nanos,
            bucket_count,
            max_total_bytes: config.max_total_bytes,
            state: Mutex::new(PreloadState {
                buckets: vec![None; bucket_count],
                topics: Vec::new(),
                active_time: start,
                stopped: false,
                pass_token: CancellationToken::new(),
                total_bytes: 0,
                generation: 0,
            }),
            change: Notify::new(),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Replaces the preloaded topic set. Already-loaded topic entries
    /// are kept; the next pass fetches only what is missing.
    pub fn set_topics(&self, mut topics: Vec<String>) {
        topics.sort();
        topics.dedup();
        let mut state = lock(&self.state);
        if state.topics == topics {
            return;
        }
        debug!(topics = topics.len(), "preload topics changed");
        state.topics = topics;
        state.generation += 1;
        state.pass_token.cancel();
        drop(state);
        self.change.notify_one();
    }

    /// Moves the sweep origin. Only restarts the pass when the origin
    /// bucket actually moves.
    pub fn set_active_time(&self, time: Time) {
        let mut state = lock(&self.state);
        let moved = self.begin_bucket(time) != self.begin_bucket(state.active_time);
        state.active_time = time;
        if moved {
            state.generation += 1;
            state.pass_token.cancel();
            drop(state);
            self.change.notify_one();
        }
    }

    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.generation += 1;
        state.pass_token.cancel();
        drop(state);
        self.change.notify_one();
    }

    pub fn buckets(&self) -> Vec<Option<Arc<TimeBucket>>> {
        lock(&self.state).buckets.clone()
    }

    pub fn preloaded_bytes(&self) -> usize {
        lock(&self.state).total_bytes
    }

    /// Runs load passes until [`stop`](Self::stop). Between passes the
    /// loop sleeps until a topic or active-time change re-arms it.
    pub async fn start<F>(&self, progress: F) -> Result<()>
    where
        F: Fn(PreloadProgress) + Send,
    {
        debug!("preload loop starting");
        loop {
            let (topics, begin, token, generation) = {
                let mut state = lock(&self.state);
                if state.stopped {
                    return Ok(());
                }
                state.pass_token = CancellationToken::new();
                (
                    state.topics.clone(),
                    self.begin_bucket(state.active_time),
                    state.pass_token.clone(),
                    state.generation,
                )
            };
            self.load_pass(&topics, begin, &token, &progress).await?;
            // A wake permit stored before this pass began can fire
            // immediately; every wakeup re-checks the generation so a
            // stale permit never starts a redundant pass.
            loop {
                let notified = self.change.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let changed = {
                    let state = lock(&self.state);
                    state.stopped || state.generation != generation
                };
                if changed {
                    break;
                }
                notified.await;
            }
        }
    }

    async fn load_pass<F>(
        &self,
        topics: &[String],
        begin: usize,
        token: &CancellationToken,
        progress: &F,
    ) -> Result<()>
    where
        F: Fn(PreloadProgress) + Send,
    {
        if topics.is_empty() {
            let state = lock(&self.state);
            progress(self.progress_snapshot(&state, topics));
            return Ok(());
        }

        let order: Vec<usize> = (begin..self.bucket_count).chain(0..begin).collect();
        let spans = self.missing_spans(&order, topics);
        let mut evict_queue: VecDeque<usize> = order.iter().rev().copied().collect();

        for span in spans {
            if token.is_cancelled() {
                return Ok(());
            }
            let read_start = self.bucket_start(span.first);
            let read_end = self.bucket_end(span.last);
            debug!(
                first = span.first,
                last = span.last,
                topics = span.missing.len(),
                "preloading span"
            );
            let cursor = self.source.message_iterator(IteratorArgs {
                topics: span.missing.clone(),
                start: Some(read_start),
                end: Some(read_end),
                hint: ConsumptionHint::Full,
            });
            let mut batch = BatchCursor::new(cursor, token.clone());
            let mut exhausted = false;

            for id in span.first..=span.last {
                evict_queue.retain(|&b| b != id);
                let results = if exhausted {
                    Vec::new()
                } else {
                    match batch.read_until(self.bucket_end(id)).await? {
                        Some(results) => results,
                        None => {
                            if token.is_cancelled() {
                                return Ok(());
                            }
                            // Source exhausted inside the span; the rest
                            // of its buckets are genuinely empty.
                            exhausted = true;
                            Vec::new()
                        }
                    }
                };

                if !self.commit_bucket(id, &span.missing, results, &mut evict_queue, topics, progress)? {
                    return Ok(());
                }
                if token.is_cancelled() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Folds one bucket's records into state. Returns false when the
    /// byte budget could not be met and the pass must stop.
    fn commit_bucket<F>(
        &self,
        id: usize,
        missing: &[String],
        results: Vec<Record>,
        evict_queue: &mut VecDeque<usize>,
        pass_topics: &[String],
        progress: &F,
    ) -> Result<bool>
    where
        F: Fn(PreloadProgress) + Send,
    {
        let mut by_topic: HashMap<String, Vec<DataRecord>> =
            missing.iter().map(|t| (t.clone(), Vec::new())).collect();
        let mut bucket_bytes = 0usize;

        let mut state = lock(&self.state);
        for record in results {
            let data = match record {
                Record::Problem(p) => {
                    self.problems.insert(format!("preload:{}", p.message), p);
                    continue;
                }
                Record::Data(d) => d,
            };
            let Some(list) = by_topic.get_mut(&data.topic) else {
                self.problems.insert(
                    format!("preload-unexpected-topic:{}", data.topic),
                    Problem::new(
                        Severity::Warn,
                        format!("source returned unrequested topic {}", data.topic),
                    ),
                );
                continue;
            };

            let size = data.size_bytes;
            while state.total_bytes + bucket_bytes + size > self.max_total_bytes {
                let Some(victim) = evict_queue.pop_front() else {
                    self.problems.insert(
                        CACHE_FULL_KEY,
                        Problem::new(
                            Severity::Error,
                            "preload cache is full; increase its size or reduce topics",
                        ),
                    );
                    progress(self.progress_snapshot(&state, pass_topics));
                    return Ok(false);
                };
                if let Some(evicted) = state.buckets[victim].take() {
                    state.total_bytes -= evicted.size_bytes;
                    debug!(bucket = victim, freed = evicted.size_bytes, "evicted preload bucket");
                }
            }
            bucket_bytes += size;
            list.push(data);
        }

        let merged = match state.buckets[id].take() {
            // Topics never overlap the missing set, so entries only add.
            Some(existing) => {
                let mut merged = (*existing).clone();
                merged.records_by_topic.extend(by_topic);
                merged.size_bytes += bucket_bytes;
                merged
            }
            None => TimeBucket { records_by_topic: by_topic, size_bytes: bucket_bytes },
        };
        state.buckets[id] = Some(Arc::new(merged));
        state.total_bytes += bucket_bytes;
        evict_queue.push_back(id);
        progress(self.progress_snapshot(&state, pass_topics));
        Ok(true)
    }

    fn missing_spans(&self, order: &[usize], topics: &[String]) -> Vec<Span> {
        let state = lock(&self.state);
        let mut spans: Vec<Span> = Vec::new();
        for &id in order {
            let missing: Vec<String> = topics
                .iter()
                .filter(|t| match &state.buckets[id] {
                    Some(b) => !b.records_by_topic.contains_key(*t),
                    None => true,
                })
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            match spans.last_mut() {
                Some(span) if span.last + 1 == id && span.missing == missing => span.last = id,
                _ => spans.push(Span { first: id, last: id, missing }),
            }
        }
        spans
    }

    fn progress_snapshot(&self, state: &PreloadState, topics: &[String]) -> PreloadProgress {
        let flags: Vec<bool> = state
            .buckets
            .iter()
            .map(|slot| match slot {
                Some(b) => topics.iter().all(|t| b.records_by_topic.contains_key(t)),
                None => false,
            })
            .collect();
        PreloadProgress {
            fully_loaded_ranges: contiguous_fraction_ranges(&flags),
            buckets: state.buckets.clone(),
            preloaded_bytes: state.total_bytes,
        }
    }

    fn bucket_of(&self, time: Time) -> usize {
        let offset = time.nanos_since(self.start) / self.bucket_duration_nanos;
        (offset as usize).min(self.bucket_count - 1)
    }

    fn begin_bucket(&self, active: Time) -> usize {
        let clamped = active.max(self.start).min(self.end);
        self.bucket_of(clamped.saturating_sub(ACTIVE_LOOKBEHIND).max(self.start))
    }

    fn bucket_start(&self, id: usize) -> Time {
        self.start.saturating_add_nanos(id as u64 * self.bucket_duration_nanos)
    }

    /// Inclusive bucket end, clamped to the log end.
    fn bucket_end(&self, id: usize) -> Time {
        self.bucket_start(id)
            .saturating_add_nanos(self.bucket_duration_nanos - 1)
            .min(self.end)
    }
}

struct Span {
    first: usize,
    last: usize,
    missing: Vec<String>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
