//! Deduplicated problem accumulator.
//!
//! Components report recoverable problems under a stable key so that a
//! recurring condition (e.g. the preload cache filling up on every
//! pass) surfaces as one entry instead of an unbounded list. Keys are
//! ordered so snapshots are deterministic.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::record::Problem;

#[derive(Debug, Default)]
pub struct ProblemStore {
    inner: Mutex<BTreeMap<String, Problem>>,
}

impl ProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the problem stored under `key`. Returns
    /// true when this changed the stored set.
    pub fn insert(&self, key: impl Into<String>, problem: Problem) -> bool {
        let key = key.into();
        let mut inner = lock(&self.inner);
        if inner.get(&key) == Some(&problem) {
            return false;
        }
        inner.insert(key, problem);
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        lock(&self.inner).remove(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Current problems in key order.
    pub fn snapshot(&self) -> Vec<Problem> {
        lock(&self.inner).values().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.inner).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Severity;

    #[test]
    fn deduplicates_by_key() {
        let store = ProblemStore::new();
        store.insert("cache-full", Problem::new(Severity::Error, "cache full"));
        store.insert("cache-full", Problem::new(Severity::Error, "cache full"));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn snapshot_is_key_ordered() {
        let store = ProblemStore::new();
        store.insert("b", Problem::new(Severity::Warn, "second"));
        store.insert("a", Problem::new(Severity::Warn, "first"));
        let msgs: Vec<_> = store.snapshot().into_iter().map(|p| p.message).collect();
        assert_eq!(msgs, vec!["first", "second"]);
    }

    #[test]
    fn remove_and_clear() {
        let store = ProblemStore::new();
        store.insert("k", Problem::new(Severity::Info, "x"));
        assert!(store.remove("k"));
        assert!(!store.remove("k"));
        store.insert("k", Problem::new(Severity::Info, "x"));
        store.clear();
        assert!(store.is_empty());
    }
}
