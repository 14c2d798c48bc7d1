//! In-memory Source
//!
//! [`MemorySource`] serves a fixed set of records from memory. It
//! backs the crate's tests and demos, and doubles as instrumentation:
//! it counts iterator opens, tracks how many cursors are live at once,
//! and logs the arguments of every read so callers can assert on cache
//! hit behavior and producer discipline.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{DataRecord, Problem, Record};
use crate::source::{
    BackfillArgs, Initialization, IteratorArgs, RecordCursor, Source, TopicInfo, TopicStats,
};
use crate::time::Time;

#[derive(Default)]
struct Instrumentation {
    iterator_calls: AtomicUsize,
    backfill_calls: AtomicUsize,
    active_cursors: AtomicUsize,
    peak_cursors: AtomicUsize,
    iterator_log: Mutex<Vec<IteratorArgs>>,
    backfill_log: Mutex<Vec<BackfillArgs>>,
}

pub struct MemorySource {
    start: Time,
    end: Time,
    records: Vec<DataRecord>,
    /// Problems interleaved into iterated streams at their tag time.
    stream_problems: Vec<(Time, Problem)>,
    init_problems: Vec<Problem>,
    backfill_delay: Mutex<Duration>,
    stats: Arc<Instrumentation>,
}

impl MemorySource {
    /// Records are sorted by time (stable, preserving the given order
    /// for equal timestamps).
    pub fn new(start: Time, end: Time, mut records: Vec<DataRecord>) -> Self {
        records.sort_by_key(|r| r.time);
        MemorySource {
            start,
            end,
            records,
            stream_problems: Vec::new(),
            init_problems: Vec::new(),
            backfill_delay: Mutex::new(Duration::ZERO),
            stats: Arc::new(Instrumentation::default()),
        }
    }

    pub fn with_stream_problem(mut self, time: Time, problem: Problem) -> Self {
        self.stream_problems.push((time, problem));
        self.stream_problems.sort_by_key(|(t, _)| *t);
        self
    }

    pub fn with_init_problem(mut self, problem: Problem) -> Self {
        self.init_problems.push(problem);
        self
    }

    /// Delays every backfill call, for exercising seek cancellation.
    pub fn set_backfill_delay(&self, delay: Duration) {
        *lock(&self.backfill_delay) = delay;
    }

    pub fn iterator_calls(&self) -> usize {
        self.stats.iterator_calls.load(Ordering::SeqCst)
    }

    pub fn backfill_calls(&self) -> usize {
        self.stats.backfill_calls.load(Ordering::SeqCst)
    }

    /// Highest number of cursors that were ever live at the same time.
    pub fn peak_concurrent_cursors(&self) -> usize {
        self.stats.peak_cursors.load(Ordering::SeqCst)
    }

    pub fn iterator_log(&self) -> Vec<IteratorArgs> {
        lock(&self.stats.iterator_log).clone()
    }

    pub fn backfill_log(&self) -> Vec<BackfillArgs> {
        lock(&self.stats.backfill_log).clone()
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn initialize(&self) -> Result<Initialization> {
        let mut names = BTreeSet::new();
        let mut topic_stats: HashMap<String, TopicStats> = HashMap::new();
        for r in &self.records {
            names.insert(r.topic.clone());
            let stats = topic_stats.entry(r.topic.clone()).or_default();
            stats.message_count += 1;
            if stats.first_time.is_none() {
                stats.first_time = Some(r.time);
            }
            stats.last_time = Some(r.time);
        }
        Ok(Initialization {
            start: self.start,
            end: self.end,
            topics: names
                .into_iter()
                .map(|name| TopicInfo { name, schema_name: None })
                .collect(),
            topic_stats,
            problems: self.init_problems.clone(),
        })
    }

    fn message_iterator(&self, args: IteratorArgs) -> Box<dyn RecordCursor> {
        self.stats.iterator_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.stats.iterator_log).push(args.clone());

        let start = args.start.unwrap_or(self.start);
        let end = args.end.unwrap_or(self.end);
        let topics: BTreeSet<&str> = args.topics.iter().map(String::as_str).collect();

        let data = self
            .records
            .iter()
            .filter(|r| r.time >= start && r.time <= end && topics.contains(r.topic.as_str()))
            .cloned();
        let problems = self
            .stream_problems
            .iter()
            .filter(|(t, _)| *t >= start && *t <= end)
            .cloned();

        // Merge problems ahead of data records with the same tag time.
        let mut items: Vec<Record> = Vec::new();
        let mut problems = problems.peekable();
        for record in data {
            while let Some((_, p)) = problems.next_if(|(t, _)| *t <= record.time) {
                items.push(Record::Problem(p));
            }
            items.push(Record::Data(record));
        }
        items.extend(problems.map(|(_, p)| Record::Problem(p)));

        Box::new(MemoryCursor {
            items: items.into_iter(),
            _guard: CursorGuard::open(self.stats.clone()),
        })
    }

    async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<DataRecord>> {
        self.stats.backfill_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.stats.backfill_log).push(args.clone());

        let delay = *lock(&self.backfill_delay);
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let mut out = Vec::new();
        for topic in &args.topics {
            if let Some(r) = self
                .records
                .iter()
                .filter(|r| &r.topic == topic && r.time <= args.time)
                .next_back()
            {
                out.push(r.clone());
            }
        }
        out.sort_by_key(|r| r.time);
        Ok(out)
    }
}

struct MemoryCursor {
    items: std::vec::IntoIter<Record>,
    _guard: CursorGuard,
}

#[async_trait]
impl RecordCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Record>> {
        Ok(self.items.next())
    }
}

struct CursorGuard {
    stats: Arc<Instrumentation>,
}

impl CursorGuard {
    fn open(stats: Arc<Instrumentation>) -> Self {
        let active = stats.active_cursors.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_cursors.fetch_max(active, Ordering::SeqCst);
        CursorGuard { stats }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.stats.active_cursors.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Severity;
    use crate::source::ConsumptionHint;
    use bytes::Bytes;

    fn rec(topic: &str, secs: u64) -> DataRecord {
        DataRecord::new(topic, Time::from_secs(secs), Bytes::from_static(b"x"))
    }

    fn args(topics: &[&str], start: Option<Time>, end: Option<Time>) -> IteratorArgs {
        IteratorArgs {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            start,
            end,
            hint: ConsumptionHint::Full,
        }
    }

    async fn drain(mut cursor: Box<dyn RecordCursor>) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = cursor.next().await.unwrap() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn filters_by_topic_and_range() {
        let source = MemorySource::new(
            Time::from_secs(0),
            Time::from_secs(10),
            vec![rec("/a", 1), rec("/b", 2), rec("/a", 5), rec("/a", 9)],
        );
        let out = drain(source.message_iterator(args(
            &["/a"],
            Some(Time::from_secs(2)),
            Some(Time::from_secs(8)),
        )))
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time(), Some(Time::from_secs(5)));
    }

    #[tokio::test]
    async fn interleaves_stream_problems() {
        let source = MemorySource::new(
            Time::from_secs(0),
            Time::from_secs(10),
            vec![rec("/a", 1), rec("/a", 5)],
        )
        .with_stream_problem(Time::from_secs(3), Problem::new(Severity::Warn, "drop"));
        let out = drain(source.message_iterator(args(&["/a"], None, None))).await;
        assert!(matches!(out[1], Record::Problem(_)));
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn backfill_returns_latest_at_or_before() {
        let source = MemorySource::new(
            Time::from_secs(0),
            Time::from_secs(10),
            vec![rec("/a", 1), rec("/a", 4), rec("/b", 6)],
        );
        let out = source
            .get_backfill_messages(BackfillArgs {
                topics: vec!["/a".into(), "/b".into()],
                time: Time::from_secs(5),
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].time, Time::from_secs(4));
    }

    #[tokio::test]
    async fn tracks_concurrent_cursors() {
        let source = MemorySource::new(Time::from_secs(0), Time::from_secs(1), vec![rec("/a", 0)]);
        let a = source.message_iterator(args(&["/a"], None, None));
        let b = source.message_iterator(args(&["/a"], None, None));
        drop(a);
        drop(b);
        assert_eq!(source.peak_concurrent_cursors(), 2);
        assert_eq!(source.iterator_calls(), 2);
    }
}
