//! This module provides the deduplication registry of in-flight and recently cached keys.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1_024;

/// A time-windowed set of cache keys.
///
/// A registered key suppresses any new fetch of that key until a maintenance sweep ([`TimeoutMap::purge_expired()`]) removes it,
/// once older than the map timeout. Entries are never expired lazily on reads: the registry is a short-lived lock against concurrent
/// duplicate dispatches, the storage creation time remaining the authority on whether an asset is fresh.
///
/// Reads are concurrent with each other, mutations are mutually exclusive.
#[derive(Debug)]
pub struct TimeoutMap {
    timeout: Duration,
    entries: RwLock<HashMap<String, Instant>>,
}

impl TimeoutMap {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: RwLock::new(HashMap::with_capacity(DEFAULT_CAPACITY)),
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    /// Register `key` at the current time.
    ///
    /// Adding a key already present keeps its original insertion time.
    pub fn add(&self, key: &str) {
        self.try_add(key);
    }

    /// Register `key` at the current time unless already present.
    ///
    /// Return `true` if the key has been registered by this call, `false` if it was already present, in which case the caller lost
    /// the race against another dispatch of the same key.
    pub fn try_add(&self, key: &str) -> bool {
        if self.contains(key) {
            return false;
        }

        // check if the entry is still vacant, otherwise it has been registered in the meantime
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(key.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    /// Remove every entry older than the map timeout and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let len = entries.len();
        entries.retain(|_, inserted_at| now.duration_since(*inserted_at) <= self.timeout);

        let purged = len - entries.len();
        tracing::debug!("Purged {purged} expired keys, {} remaining", entries.len());

        purged
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let map = TimeoutMap::new(TIMEOUT);

        map.add("old");
        tokio::time::advance(Duration::from_secs(45)).await;
        map.add("new");

        // re-adding does not renew the entry
        map.add("old");

        assert_eq!(map.purge_expired(), 0);
        assert!(map.contains("old") && map.contains("new"));

        tokio::time::advance(Duration::from_secs(30)).await;

        // no lazy expiry on reads
        assert!(map.contains("old"));

        assert_eq!(map.purge_expired(), 1);
        assert!(!map.contains("old"));
        assert!(map.contains("new"));

        tokio::time::advance(TIMEOUT).await;
        assert_eq!(map.purge_expired(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_try_add() {
        let map = TimeoutMap::new(TIMEOUT);

        assert!(map.try_add("1/a.css"));
        assert!(!map.try_add("1/a.css"));
        assert!(map.try_add("2/a.css"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_try_add_concurrently() {
        let map = Arc::new(TimeoutMap::new(TIMEOUT));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || map.try_add("js/lib.js"))
            })
            .collect();

        let winners = handles.into_iter().map(|handle| handle.join().unwrap()).filter(|&won| won).count();

        assert_eq!(winners, 1);
        assert_eq!(map.len(), 1);
    }
}
