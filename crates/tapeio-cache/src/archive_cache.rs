//! Disk cache of archives staged back from tape
//!
//! Files live at `{root}/{partition}/{archiveId}`. Space is reserved before
//! an archive is fetched, then the fetched file is renamed into place. A
//! background worker evicts least recently read archives once usage crosses
//! the eviction threshold, asking an [`EvictionJudge`] built fresh for every
//! pass which archives may go.

use crate::lru::{CacheStats, EvictionOutcome, LruCache};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tapeio_common::config::CacheConfig;
use tapeio_common::{ArchiveId, Error, Result, ensure_safe_path_segment};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Cache key: an archive within its partition
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey {
    pub partition_id: String,
    pub archive_id: ArchiveId,
}

impl ArchiveKey {
    pub fn new(partition_id: impl Into<String>, archive_id: ArchiveId) -> Self {
        Self {
            partition_id: partition_id.into(),
            archive_id,
        }
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_id, self.archive_id)
    }
}

/// Decides whether a cached archive may be evicted right now
pub trait EvictionJudge: Send {
    fn can_evict(&self, key: &ArchiveKey) -> bool;
}

/// Builds a judge reflecting the current state at the start of each pass
pub trait EvictionJudgeFactory: Send + Sync {
    fn create_judge(&self) -> Result<Box<dyn EvictionJudge>>;
}

/// Judge allowing every eviction
pub struct EvictAnything;

impl EvictionJudge for EvictAnything {
    fn can_evict(&self, _key: &ArchiveKey) -> bool {
        true
    }
}

impl EvictionJudgeFactory for EvictAnything {
    fn create_judge(&self) -> Result<Box<dyn EvictionJudge>> {
        Ok(Box::new(Self))
    }
}

/// LRU disk cache of archives
pub struct ArchiveCache {
    root: PathBuf,
    partitions: BTreeSet<String>,
    lru: LruCache<ArchiveKey>,
    judge_factory: Arc<dyn EvictionJudgeFactory>,
    eviction_wanted: Notify,
}

impl ArchiveCache {
    /// Open the cache rooted at `root` and index the archives already there.
    ///
    /// Only `partitions` may appear as directories under the root, and only
    /// archive files may appear in them. Anything else fails the startup.
    pub fn open(
        root: impl AsRef<Path>,
        partitions: BTreeSet<String>,
        config: &CacheConfig,
        judge_factory: Arc<dyn EvictionJudgeFactory>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for partition in &partitions {
            ensure_safe_path_segment(partition)?;
        }
        fs::create_dir_all(&root)?;

        let cache = Self {
            root,
            partitions,
            lru: LruCache::new(config)?,
            judge_factory,
            eviction_wanted: Notify::new(),
        };
        cache.load_existing()?;
        info!(
            "Archive cache at {} holds {} archives, {} bytes",
            cache.root.display(),
            cache.lru.len(),
            cache.lru.usage()
        );
        Ok(cache)
    }

    fn load_existing(&self) -> Result<()> {
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let file_type = dir_entry.file_type()?;
            if file_type.is_file() {
                return Err(Error::illegal_state(format!(
                    "unexpected file at cache root: {}",
                    path.display()
                )));
            }
            if !file_type.is_dir() {
                warn!("Ignoring non-regular entry {} in cache", path.display());
                continue;
            }
            let partition = dir_entry.file_name().to_string_lossy().into_owned();
            if !self.partitions.contains(&partition) {
                return Err(Error::illegal_state(format!(
                    "unknown partition directory in cache: {}",
                    path.display()
                )));
            }
            self.load_partition(&partition, &path)?;
        }
        Ok(())
    }

    fn load_partition(&self, partition: &str, dir: &Path) -> Result<()> {
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let file_type = dir_entry.file_type()?;
            if file_type.is_dir() {
                return Err(Error::illegal_state(format!(
                    "unexpected directory in cache: {}",
                    path.display()
                )));
            }
            if !file_type.is_file() {
                warn!("Ignoring non-regular entry {} in cache", path.display());
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let archive_id = ArchiveId::parse(&name).map_err(|_| {
                Error::illegal_state(format!("unexpected file in cache: {}", path.display()))
            })?;
            let metadata = dir_entry.metadata()?;
            let last_access = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .map_or(0, millis_since_epoch);
            self.lru
                .seed(ArchiveKey::new(partition, archive_id), metadata.len(), last_access)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn stats(&self) -> &CacheStats {
        self.lru.stats()
    }

    fn key(&self, partition_id: &str, archive_id: &ArchiveId) -> Result<ArchiveKey> {
        ensure_safe_path_segment(partition_id)?;
        ensure_safe_path_segment(archive_id.as_str())?;
        if !self.partitions.contains(partition_id) {
            return Err(Error::bad_request(format!("unknown partition {partition_id}")));
        }
        Ok(ArchiveKey::new(partition_id, archive_id.clone()))
    }

    fn path_of(&self, key: &ArchiveKey) -> PathBuf {
        self.root.join(&key.partition_id).join(key.archive_id.as_str())
    }

    /// Path an archive has, or will have, once cached
    pub fn archive_path(&self, partition_id: &str, archive_id: &ArchiveId) -> Result<PathBuf> {
        Ok(self.path_of(&self.key(partition_id, archive_id)?))
    }

    /// Claim space for an archive about to be fetched
    pub fn reserve(&self, partition_id: &str, archive_id: &ArchiveId, size: u64) -> Result<()> {
        let key = self.key(partition_id, archive_id)?;
        let path = self.path_of(&key);
        if path.try_exists()? {
            return Err(Error::illegal_state(format!(
                "archive {key} is already on disk at {}",
                path.display()
            )));
        }
        if let Err(e) = self.lru.reserve(key, size) {
            // room may be freed for the next attempt
            self.eviction_wanted.notify_one();
            return Err(e);
        }
        debug!("Reserved {size} bytes for archive {partition_id}/{archive_id}");
        self.request_eviction_if_needed();
        Ok(())
    }

    /// Move a fully fetched archive from `source` into the cache.
    ///
    /// `source` must be on the same filesystem as the cache and its size must
    /// equal the reserved size.
    pub fn move_to_cache(&self, source: &Path, partition_id: &str, archive_id: &ArchiveId) -> Result<()> {
        let key = self.key(partition_id, archive_id)?;
        let metadata = fs::metadata(source)?;
        if !metadata.is_file() {
            return Err(Error::illegal_state(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        let reserved = self
            .lru
            .reserved_size(&key)
            .ok_or_else(|| Error::illegal_state(format!("archive {key} is not reserved")))?;
        if reserved != metadata.len() {
            return Err(Error::illegal_state(format!(
                "archive {key} has {} bytes but {reserved} were reserved",
                metadata.len()
            )));
        }
        let target = self.path_of(&key);
        if target.try_exists()? {
            return Err(Error::illegal_state(format!(
                "archive {key} is already on disk at {}",
                target.display()
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, &target)?;
        self.lru.confirm(&key, now_millis())?;
        info!("Archive {key} moved into the cache ({reserved} bytes)");
        self.request_eviction_if_needed();
        Ok(())
    }

    /// Release a reservation when fetching failed
    pub fn cancel_reservation(&self, partition_id: &str, archive_id: &ArchiveId) -> Result<()> {
        let key = self.key(partition_id, archive_id)?;
        self.lru.cancel(&key)?;
        debug!("Cancelled reservation of archive {key}");
        Ok(())
    }

    /// Open a cached archive. A missing archive is `None`, including one
    /// evicted between the lookup and the open.
    pub fn try_read(&self, partition_id: &str, archive_id: &ArchiveId) -> Result<Option<File>> {
        let key = self.key(partition_id, archive_id)?;
        let stats = self.lru.stats();
        if !self.lru.contains(&key) {
            stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        match File::open(self.path_of(&key)) {
            Ok(file) => {
                self.lru.touch(&key, now_millis());
                stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Archive {key} evicted while being opened");
                stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the archive is cached. Reservations do not count.
    pub fn contains(&self, partition_id: &str, archive_id: &ArchiveId) -> bool {
        self.key(partition_id, archive_id)
            .is_ok_and(|key| self.lru.contains(&key))
    }

    pub fn is_reserved(&self, partition_id: &str, archive_id: &ArchiveId) -> bool {
        self.key(partition_id, archive_id)
            .is_ok_and(|key| self.lru.is_reserved(&key))
    }

    /// Committed plus reserved bytes
    pub fn current_usage(&self) -> u64 {
        self.lru.usage()
    }

    /// Cached archives, least recently read first
    pub fn cached_archives(&self) -> Vec<ArchiveKey> {
        self.lru.keys_by_age()
    }

    fn request_eviction_if_needed(&self) {
        if self.lru.needs_eviction() {
            self.eviction_wanted.notify_one();
        }
    }

    /// Run one eviction pass synchronously
    pub fn run_eviction_pass(&self) -> Result<EvictionOutcome> {
        let judge = self.judge_factory.create_judge()?;
        let outcome = self.lru.evict(
            |key| judge.can_evict(key),
            |key, size| {
                let path = self.path_of(key);
                match fs::remove_file(&path) {
                    Ok(()) => info!("Evicted archive {key} ({size} bytes)"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn!("Evicted archive {key} was already gone from disk");
                    }
                    Err(e) => error!("Failed to delete evicted archive {}: {e}", path.display()),
                }
            },
        );
        Ok(outcome)
    }

    /// Spawn the background eviction worker
    pub fn start_eviction_worker(self: &Arc<Self>) -> EvictionWorker {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let span = info_span!("archive-cache-eviction", root = %self.root.display());
        let handle = tokio::spawn(
            async move {
                // the index may already be over the threshold after startup
                cache.request_eviction_if_needed();
                loop {
                    tokio::select! {
                        () = cache.eviction_wanted.notified() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let pass = Arc::clone(&cache);
                    match tokio::task::spawn_blocking(move || pass.run_eviction_pass()).await {
                        Ok(Ok(outcome)) => debug!(
                            "Eviction pass freed {} bytes from {} archives",
                            outcome.freed_bytes, outcome.evicted
                        ),
                        Ok(Err(e)) => error!("Eviction pass failed: {e}"),
                        Err(e) => error!("Eviction pass panicked: {e}"),
                    }
                }
                info!("Eviction worker stopped");
            }
            .instrument(span),
        );
        EvictionWorker {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Owned handle on the eviction worker
pub struct EvictionWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EvictionWorker {
    /// Stop the worker and wait for the pass in progress, if any
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Eviction worker terminated abnormally: {e}");
        }
    }
}

fn millis_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn now_millis() -> u64 {
    millis_since_epoch(SystemTime::now())
}
