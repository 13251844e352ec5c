// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Read-through balance cache.
//!
//! The cache is a disposable projection of account rows. The engine fills it
//! on a miss and invalidates it after every committed write; a failing cache
//! degrades reads to the store and never fails an operation.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use thiserror::Error;

use super::types::{AccountId, Version};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("balance cache unavailable: {0}")]
    Unavailable(String),
}

/// Balance snapshot as of an account version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBalance {
    pub balance: i64,
    pub version: Version,
}

/// Key-value balance cache with TTL and versioned invalidation.
pub trait BalanceCache: Send + Sync + 'static {
    /// `Ok(None)` is a miss.
    fn get(&self, id: &AccountId) -> Result<Option<CachedBalance>, CacheError>;

    /// Populate after a miss. Ignored when the cache already knows of a
    /// newer version of the account.
    fn set(&self, id: &AccountId, value: CachedBalance) -> Result<(), CacheError>;

    /// Drop the entry after a commit that produced `committed_version`.
    fn invalidate(&self, id: &AccountId, committed_version: Version) -> Result<(), CacheError>;
}

enum Slot {
    Balance(CachedBalance),
    /// Left by `invalidate`; rejects `set` calls older than `floor`.
    Tombstone { floor: Version },
}

struct CacheEntry {
    slot: Slot,
    inserted_at: Instant,
}

/// In-process LRU balance cache.
pub struct LruBalanceCache {
    cache: Mutex<LruCache<AccountId, CacheEntry>>,
    ttl: Duration,
}

impl LruBalanceCache {
    /// Create a new cache with the given capacity and TTL.
    ///
    /// - `capacity`: Max number of accounts tracked (tombstones included).
    /// - `ttl`: Time-to-live for each cache entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<AccountId, CacheEntry>>, CacheError> {
        self.cache
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }

    /// Version below which `set` is refused for `id`, if a live entry exists.
    fn floor(&self, entry: &CacheEntry) -> Option<Version> {
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(match entry.slot {
            Slot::Balance(value) => value.version,
            Slot::Tombstone { floor } => floor,
        })
    }
}

impl BalanceCache for LruBalanceCache {
    fn get(&self, id: &AccountId) -> Result<Option<CachedBalance>, CacheError> {
        let mut cache = self.lock()?;
        if let Some(entry) = cache.get(id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(match entry.slot {
                    Slot::Balance(value) => Some(value),
                    Slot::Tombstone { .. } => None,
                });
            }
            // Expired
            cache.pop(id);
        }
        Ok(None)
    }

    fn set(&self, id: &AccountId, value: CachedBalance) -> Result<(), CacheError> {
        let mut cache = self.lock()?;
        if let Some(floor) = cache.peek(id).and_then(|entry| self.floor(entry)) {
            if value.version < floor {
                return Ok(());
            }
        }
        cache.put(
            *id,
            CacheEntry {
                slot: Slot::Balance(value),
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn invalidate(&self, id: &AccountId, committed_version: Version) -> Result<(), CacheError> {
        let mut cache = self.lock()?;
        let floor = cache
            .peek(id)
            .and_then(|entry| self.floor(entry))
            .map_or(committed_version, |existing| existing.max(committed_version));
        cache.put(
            *id,
            CacheEntry {
                slot: Slot::Tombstone { floor },
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AccountRef;

    fn id(owner: &str) -> AccountId {
        AccountRef::new(owner, "FXY").id()
    }

    fn bal(balance: i64, version: Version) -> CachedBalance {
        CachedBalance { balance, version }
    }

    #[test]
    fn cache_set_and_get() {
        let cache = LruBalanceCache::new(10, Duration::from_secs(300));
        assert_eq!(cache.get(&id("alice")).unwrap(), None);

        cache.set(&id("alice"), bal(100, 1)).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), Some(bal(100, 1)));
        assert_eq!(cache.get(&id("bob")).unwrap(), None);
    }

    #[test]
    fn invalidate_turns_entry_into_miss() {
        let cache = LruBalanceCache::new(10, Duration::from_secs(300));
        cache.set(&id("alice"), bal(100, 1)).unwrap();
        cache.invalidate(&id("alice"), 2).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), None);
    }

    #[test]
    fn set_older_than_invalidation_is_ignored() {
        let cache = LruBalanceCache::new(10, Duration::from_secs(300));
        cache.invalidate(&id("alice"), 2).unwrap();

        // A reader that loaded version 1 before the commit lost the race.
        cache.set(&id("alice"), bal(100, 1)).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), None);

        cache.set(&id("alice"), bal(70, 2)).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), Some(bal(70, 2)));
    }

    #[test]
    fn set_never_downgrades_a_cached_version() {
        let cache = LruBalanceCache::new(10, Duration::from_secs(300));
        cache.set(&id("alice"), bal(70, 2)).unwrap();
        cache.set(&id("alice"), bal(100, 1)).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), Some(bal(70, 2)));
    }

    #[test]
    fn invalidation_floor_only_moves_forward() {
        let cache = LruBalanceCache::new(10, Duration::from_secs(300));
        cache.invalidate(&id("alice"), 5).unwrap();
        cache.invalidate(&id("alice"), 3).unwrap();
        cache.set(&id("alice"), bal(1, 4)).unwrap();
        assert_eq!(cache.get(&id("alice")).unwrap(), None);
    }

    #[test]
    fn cache_ttl_expiry() {
        let cache = LruBalanceCache::new(10, Duration::from_millis(1));
        cache.set(&id("alice"), bal(100, 1)).unwrap();

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get(&id("alice")).unwrap(), None);
        // Expired tombstones no longer block fills either.
        cache.invalidate(&id("alice"), 9).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.set(&id("alice"), bal(5, 1)).unwrap();
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = LruBalanceCache::new(2, Duration::from_secs(300));
        cache.set(&id("a"), bal(1, 1)).unwrap();
        cache.set(&id("b"), bal(2, 1)).unwrap();
        cache.get(&id("a")).unwrap();
        cache.set(&id("c"), bal(3, 1)).unwrap();

        assert!(cache.get(&id("a")).unwrap().is_some());
        assert!(cache.get(&id("b")).unwrap().is_none());
        assert!(cache.get(&id("c")).unwrap().is_some());
    }
}
