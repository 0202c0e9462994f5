//! TapeIO Cache - disk cache of archives staged from tape
//!
//! [`LruCache`] does the capacity bookkeeping (reservations, committed
//! entries, least-recently-used order) and [`ArchiveCache`] applies it to
//! archive files on disk, with a background eviction worker.

pub mod archive_cache;
pub mod lru;

pub use archive_cache::{
    ArchiveCache, ArchiveKey, EvictAnything, EvictionJudge, EvictionJudgeFactory, EvictionWorker,
};
pub use lru::{CacheStats, EvictionOutcome, LruCache};
