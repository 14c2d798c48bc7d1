//! Read-Ahead Buffer
//!
//! Sits between the [`RangeCache`] and the playback loop. A background
//! producer task drains a cache cursor into a FIFO queue, staying a
//! bounded time horizon ahead of the consumer's read head, so tick
//! reads almost never wait on I/O.
//!
//! ## Backpressure
//!
//! The producer recomputes `read_until = read_head + read_ahead` after
//! every enqueue and parks once the last queued record reaches that
//! horizon; every consumer dequeue advances the read head and wakes it.
//! The consumer in turn is only woken once at least `min_read_ahead`
//! is buffered (or the stream ends), which batches wakeups during
//! bursty reads.
//!
//! ## Single producer
//!
//! `iterate` cancels and joins any previous producer before spawning a
//! new one; there is never more than one source read in flight.
//! Superseded iterators are fenced by an epoch counter and simply
//! report end-of-stream.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use logplay_core::{
    BackfillArgs, ConsumptionHint, DataRecord, Error, FractionRange, Initialization, IteratorArgs,
    Record, Result, Source, Time,
};

use crate::config::{CacheConfig, ReadAheadConfig};
use crate::range_cache::{CacheCursor, RangeCache};

struct QueueState {
    items: VecDeque<Record>,
    /// Time of the last record handed to the consumer.
    read_head: Time,
    done: bool,
    failed: Option<Error>,
    /// Incremented per `iterate`; fences superseded iterators.
    epoch: u64,
}

struct Shared {
    queue: Mutex<QueueState>,
    /// Producer -> consumer: records available (or stream over).
    read_signal: Notify,
    /// Consumer -> producer: read head advanced.
    write_signal: Notify,
}

pub struct ReadAheadBuffer {
    cache: Arc<RangeCache>,
    read_ahead_nanos: u64,
    min_read_ahead_nanos: u64,
    shared: Arc<Shared>,
    producer: Mutex<Option<Producer>>,
}

struct Producer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReadAheadBuffer {
    pub fn new(
        source: Arc<dyn Source>,
        cache_config: &CacheConfig,
        config: &ReadAheadConfig,
    ) -> Result<Self> {
        if config.min_read_ahead > config.read_ahead {
            return Err(Error::invariant("min_read_ahead exceeds read_ahead"));
        }
        Ok(ReadAheadBuffer {
            cache: Arc::new(RangeCache::new(source, cache_config)),
            read_ahead_nanos: duration_nanos(config.read_ahead),
            min_read_ahead_nanos: duration_nanos(config.min_read_ahead),
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    read_head: Time::MIN,
                    done: false,
                    failed: None,
                    epoch: 0,
                }),
                read_signal: Notify::new(),
                write_signal: Notify::new(),
            }),
            producer: Mutex::new(None),
        })
    }

    pub async fn initialize(&self) -> Result<Initialization> {
        self.cache.initialize().await
    }

    pub fn initialization(&self) -> Option<&Initialization> {
        self.cache.initialization()
    }

    /// Starts buffering from `args.start` and returns the consumer
    /// iterator. Any previous producer is stopped first.
    pub async fn iterate(&self, args: IteratorArgs) -> Result<ReadAheadIterator> {
        self.stop().await;

        let init = self.cache.initialization().ok_or(Error::Uninitialized)?;
        let start = args.start.unwrap_or(init.start);

        let epoch = {
            let mut q = self.shared.queue.lock().await;
            q.items.clear();
            q.read_head = start;
            q.done = args.topics.is_empty();
            q.failed = None;
            q.epoch += 1;
            q.epoch
        };
        if args.topics.is_empty() {
            return Ok(ReadAheadIterator { shared: self.shared.clone(), epoch, finished: false });
        }

        let cursor = self
            .cache
            .iterate(IteratorArgs {
                topics: args.topics,
                start: Some(start),
                end: None,
                hint: ConsumptionHint::Partial,
            })
            .await?;

        debug!(%start, "starting read-ahead producer");
        let token = CancellationToken::new();
        let handle = tokio::spawn(produce(
            cursor,
            self.shared.clone(),
            token.clone(),
            self.read_ahead_nanos,
            self.min_read_ahead_nanos,
        ));
        *self.producer.lock().await = Some(Producer { token, handle });

        Ok(ReadAheadIterator { shared: self.shared.clone(), epoch, finished: false })
    }

    /// Cancels and joins the producer, if one is running.
    pub async fn stop(&self) {
        let producer = self.producer.lock().await.take();
        if let Some(p) = producer {
            debug!("stopping read-ahead producer");
            p.token.cancel();
            self.shared.write_signal.notify_one();
            let _ = p.handle.await;
        }
    }

    pub async fn get_backfill_messages(&self, args: BackfillArgs) -> Result<Vec<DataRecord>> {
        self.cache.get_backfill_messages(args).await
    }

    pub async fn loaded_ranges(&self) -> Vec<FractionRange> {
        self.cache.loaded_ranges().await
    }

    pub async fn cached_bytes(&self) -> usize {
        self.cache.total_bytes().await
    }

    /// Records currently queued ahead of the consumer.
    pub async fn queued_records(&self) -> usize {
        self.shared.queue.lock().await.items.len()
    }
}

async fn produce(
    mut cursor: CacheCursor,
    shared: Arc<Shared>,
    token: CancellationToken,
    read_ahead_nanos: u64,
    min_read_ahead_nanos: u64,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = cursor.next() => next,
        };
        let record = match next {
            Err(e) => {
                shared.queue.lock().await.failed = Some(e);
                break;
            }
            Ok(None) => break,
            Ok(Some(record)) => record,
        };
        let time = record.time();
        shared.queue.lock().await.items.push_back(record);

        let Some(t) = time else {
            // Timeless records never satisfy a horizon; pass them on.
            shared.read_signal.notify_one();
            continue;
        };
        let mut notified = false;
        loop {
            let read_head = shared.queue.lock().await.read_head;
            if t < read_head.saturating_add_nanos(min_read_ahead_nanos) {
                break;
            }
            if !notified {
                shared.read_signal.notify_one();
                notified = true;
            }
            if t < read_head.saturating_add_nanos(read_ahead_nanos) {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    finish(&shared).await;
                    return;
                }
                _ = shared.write_signal.notified() => {}
            }
        }
    }
    finish(&shared).await;
}

async fn finish(shared: &Shared) {
    shared.queue.lock().await.done = true;
    shared.read_signal.notify_one();
}

pub struct ReadAheadIterator {
    shared: Arc<Shared>,
    epoch: u64,
    finished: bool,
}

impl ReadAheadIterator {
    pub async fn next(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            {
                let mut q = self.shared.queue.lock().await;
                if q.epoch != self.epoch {
                    // Superseded; hand the wakeup to the live iterator.
                    self.finished = true;
                    drop(q);
                    self.shared.read_signal.notify_one();
                    return Ok(None);
                }
                if let Some(e) = q.failed.take() {
                    self.finished = true;
                    return Err(e);
                }
                if let Some(record) = q.items.pop_front() {
                    if let Some(t) = record.time() {
                        q.read_head = t;
                    }
                    drop(q);
                    self.shared.write_signal.notify_one();
                    return Ok(Some(record));
                }
                if q.done {
                    self.finished = true;
                    return Ok(None);
                }
            }
            self.shared.read_signal.notified().await;
        }
    }
}

fn duration_nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
