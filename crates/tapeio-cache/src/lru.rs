//! Capacity-bounded LRU index with two-phase insertion
//!
//! The index only does bookkeeping: it never touches the data it accounts
//! for. Space is claimed with `reserve` before any byte exists, then either
//! turned into a committed entry with `confirm` or released with `cancel`.
//! Reserved bytes count against capacity just like committed ones.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tapeio_common::config::CacheConfig;
use tapeio_common::{Error, Result};
use tracing::{debug, error};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of reads served from the cache
    pub hits: AtomicU64,
    /// Number of reads that found nothing
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
    /// Number of reservations refused for lack of space
    pub rejected_reservations: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

#[derive(Clone, Copy, Debug)]
struct Committed {
    size: u64,
    last_access: u64,
}

struct LruState<K> {
    committed: HashMap<K, Committed>,
    /// `(last_access, key)`, oldest first
    order: BTreeSet<(u64, K)>,
    reserved: HashMap<K, u64>,
    /// Committed plus reserved bytes
    usage: u64,
}

/// Result of one eviction pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub evicted: usize,
    pub freed_bytes: u64,
    /// Usage once the pass ended
    pub usage: u64,
    /// Whether usage ended below the safe threshold
    pub reached_safe_threshold: bool,
}

/// LRU index over keys of type `K`
pub struct LruCache<K> {
    state: Mutex<LruState<K>>,
    max_capacity: u64,
    eviction_threshold: u64,
    safe_threshold: u64,
    stats: CacheStats,
}

impl<K> LruCache<K>
where
    K: Clone + Eq + Hash + Ord + Debug,
{
    /// Create an empty index. Thresholds must satisfy max > eviction > safe > 0.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(LruState {
                committed: HashMap::new(),
                order: BTreeSet::new(),
                reserved: HashMap::new(),
                usage: 0,
            }),
            max_capacity: config.max_capacity_bytes,
            eviction_threshold: config.eviction_threshold_bytes,
            safe_threshold: config.safe_threshold_bytes,
            stats: CacheStats::default(),
        })
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub const fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Claim `size` bytes for `key`.
    ///
    /// Fails if the key is already reserved or committed, or if the claim
    /// would push usage above the maximum capacity.
    pub fn reserve(&self, key: K, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.committed.contains_key(&key) {
            return Err(Error::illegal_state(format!("{key:?} is already cached")));
        }
        if state.reserved.contains_key(&key) {
            return Err(Error::illegal_state(format!("{key:?} is already reserved")));
        }
        let Some(usage) = state.usage.checked_add(size).filter(|u| *u <= self.max_capacity) else {
            self.stats.rejected_reservations.fetch_add(1, Ordering::Relaxed);
            return Err(Error::illegal_state(format!(
                "cannot reserve {size} bytes for {key:?}: {} of {} bytes in use",
                state.usage, self.max_capacity
            )));
        };
        state.usage = usage;
        state.reserved.insert(key, size);
        Ok(())
    }

    /// Size reserved for `key`, if any
    pub fn reserved_size(&self, key: &K) -> Option<u64> {
        self.state.lock().reserved.get(key).copied()
    }

    /// Turn a reservation into a committed entry last accessed at `timestamp`
    pub fn confirm(&self, key: &K, timestamp: u64) -> Result<()> {
        let mut state = self.state.lock();
        let size = state
            .reserved
            .remove(key)
            .ok_or_else(|| Error::illegal_state(format!("{key:?} is not reserved")))?;
        state.order.insert((timestamp, key.clone()));
        state.committed.insert(
            key.clone(),
            Committed {
                size,
                last_access: timestamp,
            },
        );
        Ok(())
    }

    /// Release a reservation
    pub fn cancel(&self, key: &K) -> Result<()> {
        let mut state = self.state.lock();
        let size = state
            .reserved
            .remove(key)
            .ok_or_else(|| Error::illegal_state(format!("{key:?} is not reserved")))?;
        state.usage -= size;
        Ok(())
    }

    /// Register an entry that already exists, bypassing reservation.
    ///
    /// Used to seed the index at startup; capacity is not checked so that a
    /// cache left over-full is still fully indexed and can be evicted.
    pub fn seed(&self, key: K, size: u64, timestamp: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.committed.contains_key(&key) || state.reserved.contains_key(&key) {
            return Err(Error::illegal_state(format!("{key:?} is indexed twice")));
        }
        state.usage = state.usage.saturating_add(size);
        state.order.insert((timestamp, key.clone()));
        state.committed.insert(
            key,
            Committed {
                size,
                last_access: timestamp,
            },
        );
        Ok(())
    }

    /// Bump the access time of a committed entry. Returns false if absent.
    pub fn touch(&self, key: &K, timestamp: u64) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.committed.get_mut(key) else {
            return false;
        };
        let previous = entry.last_access;
        // never move an entry backwards in the order
        let now = timestamp.max(previous);
        entry.last_access = now;
        if now != previous {
            state.order.remove(&(previous, key.clone()));
            state.order.insert((now, key.clone()));
        }
        true
    }

    /// Whether `key` is committed. Reservations do not count.
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().committed.contains_key(key)
    }

    pub fn is_reserved(&self, key: &K) -> bool {
        self.state.lock().reserved.contains_key(key)
    }

    /// Committed plus reserved bytes
    pub fn usage(&self) -> u64 {
        self.state.lock().usage
    }

    pub fn len(&self) -> usize {
        self.state.lock().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn needs_eviction(&self) -> bool {
        self.usage() >= self.eviction_threshold
    }

    /// Committed keys, least recently used first
    pub fn keys_by_age(&self) -> Vec<K> {
        self.state.lock().order.iter().map(|(_, k)| k.clone()).collect()
    }

    /// Evict committed entries, oldest first, until usage drops below the
    /// safe threshold.
    ///
    /// `can_evict` is consulted without holding the index lock. An entry that
    /// was touched while being judged keeps its place. `on_evict` runs after
    /// the entry has left the index.
    pub fn evict<J, F>(&self, can_evict: J, mut on_evict: F) -> EvictionOutcome
    where
        J: Fn(&K) -> bool,
        F: FnMut(&K, u64),
    {
        let candidates: Vec<(u64, K)> = self.state.lock().order.iter().cloned().collect();

        let mut outcome = EvictionOutcome::default();
        for (timestamp, key) in candidates {
            if self.usage() < self.safe_threshold {
                break;
            }
            if !can_evict(&key) {
                debug!("Eviction of {key:?} refused");
                continue;
            }
            let removed = {
                let mut state = self.state.lock();
                match state.committed.get(&key) {
                    Some(entry) if entry.last_access == timestamp => {
                        let size = entry.size;
                        state.committed.remove(&key);
                        state.order.remove(&(timestamp, key.clone()));
                        state.usage -= size;
                        Some(size)
                    }
                    _ => None,
                }
            };
            if let Some(size) = removed {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                outcome.evicted += 1;
                outcome.freed_bytes += size;
                on_evict(&key, size);
            }
        }

        outcome.usage = self.usage();
        outcome.reached_safe_threshold = outcome.usage < self.safe_threshold;
        if !outcome.reached_safe_threshold {
            error!(
                "Cache still holds {} bytes after evicting {} entries, safe threshold is {} bytes",
                outcome.usage, outcome.evicted, self.safe_threshold
            );
        }
        outcome
    }
}
