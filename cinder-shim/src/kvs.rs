//! Per-step key-value store (spec 4.6). `Put` stages a pair in the
//! caller's connection-local scratch buffer; `Commit` moves staged
//! pairs into a pending set; a successful `Barrier` publishes the
//! pending set atomically and bumps the generation, per the happens-
//! before edge spec 5 requires between a committing `Put` and a
//! subsequent `Get`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use cinder_common::error::{Error, Result};

pub const MAX_KEY_BYTES_DEFAULT: usize = 256;
pub const MAX_VALUE_BYTES_DEFAULT: usize = 1024;

#[derive(Default)]
struct KvsInner {
    committed: HashMap<String, String>,
    pending: HashMap<String, String>,
}

pub struct Kvs {
    inner: Mutex<KvsInner>,
    generation: AtomicU64,
    max_key_bytes: usize,
    max_value_bytes: usize,
}

impl Kvs {
    pub fn new(max_key_bytes: usize, max_value_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(KvsInner::default()),
            generation: AtomicU64::new(0),
            max_key_bytes,
            max_value_bytes,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn check_bounds(&self, key: &str, value: &str) -> Result<()> {
        if key.len() > self.max_key_bytes {
            return Err(Error::validation(format!(
                "key exceeds {} bytes",
                self.max_key_bytes
            )));
        }
        if value.len() > self.max_value_bytes {
            return Err(Error::validation(format!(
                "value exceeds {} bytes",
                self.max_value_bytes
            )));
        }
        Ok(())
    }

    /// Merges a connection's staged `Put`s into the pending set. Last
    /// writer wins within a generation, per spec 4.6.
    pub fn commit(&self, staged: HashMap<String, String>) {
        let mut inner = self.inner.lock();
        for (k, v) in staged {
            inner.pending.insert(k, v);
        }
    }

    /// Publishes the pending set and bumps the generation. Called
    /// exactly once per completed barrier, by whichever task observes
    /// the collective complete.
    pub fn publish_pending(&self) -> u64 {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        inner.committed.extend(pending);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().committed.get(key).cloned()
    }

    /// Snapshot of the committed set in deterministic key order, for
    /// `Iter`. Taken once per iterator at first use.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let mut pairs: Vec<(String, String)> =
            inner.committed.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_commit_barrier_then_get_sees_the_value() {
        let kvs = Kvs::new(MAX_KEY_BYTES_DEFAULT, MAX_VALUE_BYTES_DEFAULT);
        assert_eq!(kvs.get("x"), None);
        let mut staged = HashMap::new();
        staged.insert("x".to_string(), "1".to_string());
        kvs.commit(staged);
        // Not visible until a barrier publishes it.
        assert_eq!(kvs.get("x"), None);
        assert_eq!(kvs.publish_pending(), 1);
        assert_eq!(kvs.get("x"), Some("1".to_string()));
    }

    #[test]
    fn last_writer_wins_within_a_generation() {
        let kvs = Kvs::new(MAX_KEY_BYTES_DEFAULT, MAX_VALUE_BYTES_DEFAULT);
        let mut a = HashMap::new();
        a.insert("x".to_string(), "1".to_string());
        kvs.commit(a);
        let mut b = HashMap::new();
        b.insert("x".to_string(), "2".to_string());
        kvs.commit(b);
        kvs.publish_pending();
        assert_eq!(kvs.get("x"), Some("2".to_string()));
    }

    #[test]
    fn oversize_key_or_value_is_rejected() {
        let kvs = Kvs::new(4, 4);
        assert!(kvs.check_bounds("short", "ok").is_err());
        assert!(kvs.check_bounds("ok", "toolong").is_err());
        assert!(kvs.check_bounds("ok", "ok").is_ok());
    }

    #[test]
    fn snapshot_is_sorted_and_stable() {
        let kvs = Kvs::new(MAX_KEY_BYTES_DEFAULT, MAX_VALUE_BYTES_DEFAULT);
        let mut staged = HashMap::new();
        staged.insert("b".to_string(), "2".to_string());
        staged.insert("a".to_string(), "1".to_string());
        kvs.commit(staged);
        kvs.publish_pending();
        assert_eq!(
            kvs.snapshot(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }
}
