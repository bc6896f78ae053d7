//! Replay-rejection bookkeeping for step-launch credentials (spec 4.5,
//! 5). The agent keeps a set of credential identities it has already
//! launched; re-delivery of the same credential to the same node is
//! rejected with `ALREADY_LAUNCHED`. Entries are kept for the
//! allocation's lifetime plus a grace period, matching spec 5's "keeps
//! a bloom or set of seen credential ids to reject replays for the
//! allocation's lifetime plus a 5-minute grace."

use std::collections::HashMap;

use parking_lot::Mutex;

/// Keyed by `CredentialPayload::identity()`; value is the unix
/// timestamp after which the entry may be forgotten.
#[derive(Default)]
pub struct CredentialCache {
    seen: Mutex<HashMap<String, i64>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `identity` if this is the first time
    /// it has been seen; returns `false` (a replay) otherwise. Expired
    /// entries are swept lazily on every call, bounding the map's size
    /// without a separate background task.
    pub fn check_and_insert(&self, identity: String, now_unix: i64, expires_unix: i64) -> bool {
        let mut seen = self.seen.lock();
        seen.retain(|_, &mut exp| exp > now_unix);
        if seen.contains_key(&identity) {
            return false;
        }
        seen.insert(identity, expires_unix);
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_replay_within_grace() {
        let cache = CredentialCache::new();
        assert!(cache.check_and_insert("cred-a".into(), 100, 500));
        assert!(!cache.check_and_insert("cred-a".into(), 200, 500));
    }

    #[test]
    fn forgets_after_expiry() {
        let cache = CredentialCache::new();
        assert!(cache.check_and_insert("cred-a".into(), 100, 150));
        assert!(cache.check_and_insert("cred-a".into(), 400, 900));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_identities_both_accepted() {
        let cache = CredentialCache::new();
        assert!(cache.check_and_insert("cred-a".into(), 100, 500));
        assert!(cache.check_and_insert("cred-b".into(), 100, 500));
        assert_eq!(cache.len(), 2);
    }
}
