//! Batching cursor adapter.
//!
//! [`BatchCursor`] drains a [`RecordCursor`] in time-bounded batches:
//! each `read_until` call collects every record at or before the given
//! time. The first record past the bound is held back and returned by
//! the next call, so a single source iteration can fill consecutive
//! buckets without re-reading.

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::record::Record;
use crate::source::RecordCursor;
use crate::time::Time;

pub struct BatchCursor {
    cursor: Box<dyn RecordCursor>,
    cancel: CancellationToken,
    /// First record read past the previous batch bound.
    held: Option<Record>,
    exhausted: bool,
}

impl BatchCursor {
    pub fn new(cursor: Box<dyn RecordCursor>, cancel: CancellationToken) -> Self {
        BatchCursor { cursor, cancel, held: None, exhausted: false }
    }

    /// Collects records with time at or before `until` (timeless
    /// problem records are always included). Returns `Ok(None)` when
    /// cancelled, or when the cursor is exhausted and nothing remains.
    pub async fn read_until(&mut self, until: Time) -> Result<Option<Vec<Record>>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let mut out = Vec::new();
        if let Some(record) = self.held.take() {
            match record.time() {
                Some(t) if t > until => {
                    self.held = Some(record);
                    return Ok(Some(out));
                }
                _ => out.push(record),
            }
        }
        if self.exhausted {
            return if out.is_empty() { Ok(None) } else { Ok(Some(out)) };
        }
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                next = self.cursor.next() => next?,
            };
            match next {
                None => {
                    self.exhausted = true;
                    break;
                }
                Some(record) => match record.time() {
                    Some(t) if t > until => {
                        self.held = Some(record);
                        break;
                    }
                    _ => out.push(record),
                },
            }
        }
        if self.exhausted && out.is_empty() && self.held.is_none() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use crate::record::DataRecord;
    use crate::source::{ConsumptionHint, IteratorArgs, Source};
    use bytes::Bytes;

    fn rec(topic: &str, secs: u64) -> DataRecord {
        DataRecord::new(topic, Time::from_secs(secs), Bytes::from_static(b"x"))
    }

    fn source() -> MemorySource {
        MemorySource::new(
            Time::from_secs(0),
            Time::from_secs(10),
            vec![rec("/a", 1), rec("/a", 3), rec("/a", 7)],
        )
    }

    #[tokio::test]
    async fn batches_are_split_at_the_bound() {
        let source = source();
        let cursor = source.message_iterator(IteratorArgs {
            topics: vec!["/a".into()],
            start: None,
            end: None,
            hint: ConsumptionHint::Full,
        });
        let mut batch = BatchCursor::new(cursor, CancellationToken::new());

        let first = batch.read_until(Time::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        // The record at 3s was read past the bound and held back.
        let second = batch.read_until(Time::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(second[0].time(), Some(Time::from_secs(3)));
    }

    #[tokio::test]
    async fn empty_window_yields_empty_batch_not_none() {
        let source = source();
        let cursor = source.message_iterator(IteratorArgs {
            topics: vec!["/a".into()],
            start: Some(Time::from_secs(4)),
            end: None,
            hint: ConsumptionHint::Full,
        });
        let mut batch = BatchCursor::new(cursor, CancellationToken::new());
        let batch_out = batch.read_until(Time::from_secs(5)).await.unwrap();
        assert_eq!(batch_out, Some(vec![]));
    }

    #[tokio::test]
    async fn exhaustion_returns_none() {
        let source = source();
        let cursor = source.message_iterator(IteratorArgs {
            topics: vec!["/a".into()],
            start: None,
            end: None,
            hint: ConsumptionHint::Full,
        });
        let mut batch = BatchCursor::new(cursor, CancellationToken::new());
        let all = batch.read_until(Time::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(batch.read_until(Time::from_secs(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_returns_none() {
        let source = source();
        let cursor = source.message_iterator(IteratorArgs {
            topics: vec!["/a".into()],
            start: None,
            end: None,
            hint: ConsumptionHint::Full,
        });
        let token = CancellationToken::new();
        let mut batch = BatchCursor::new(cursor, token.clone());
        token.cancel();
        assert_eq!(batch.read_until(Time::from_secs(10)).await.unwrap(), None);
    }
}
