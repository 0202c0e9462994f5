//! Eviction policy of the archive cache
//!
//! An archive may leave the cache unless one of these holds:
//! - a reader currently holds an eviction lock on it;
//! - its partition is pinned in the cache forever;
//! - it holds an object named by a non-expired access request.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tapeio_cache::{ArchiveKey, EvictionJudge, EvictionJudgeFactory};
use tapeio_common::{ArchiveId, Result, TopologyResolver};
use tapeio_meta_store::MetaStore;
use tracing::debug;

type LockCounts = Arc<DashMap<ArchiveId, usize>>;

/// Reference-counted eviction locks plus the judge factory of the cache
pub struct EvictionController {
    locks: LockCounts,
    store: Arc<MetaStore>,
    topology: Arc<dyn TopologyResolver>,
}

impl EvictionController {
    pub fn new(store: Arc<MetaStore>, topology: Arc<dyn TopologyResolver>) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            store,
            topology,
        }
    }

    /// Keep `archive_ids` in the cache until the guard is dropped
    pub fn lock(&self, archive_ids: impl IntoIterator<Item = ArchiveId>) -> EvictionLockGuard {
        let archive_ids: Vec<ArchiveId> = archive_ids.into_iter().collect();
        for id in &archive_ids {
            *self.locks.entry(id.clone()).or_insert(0) += 1;
        }
        EvictionLockGuard {
            locks: Arc::clone(&self.locks),
            archive_ids,
        }
    }

    pub fn is_locked(&self, archive_id: &ArchiveId) -> bool {
        self.locks.contains_key(archive_id)
    }

    /// Archives holding objects named by requests that have not expired
    fn archives_of_active_requests(&self) -> Result<HashSet<ArchiveId>> {
        let object_ids = self
            .store
            .list_distinct_object_ids_for_active_requests(Utc::now())?;
        let mut by_container: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (container, name) in object_ids {
            by_container.entry(container).or_default().push(name);
        }
        let mut archives = HashSet::new();
        for (container, names) in by_container {
            for object in self.store.bulk_find_objects(&container, &names)? {
                archives.extend(object.location.archive_ids());
            }
        }
        Ok(archives)
    }
}

impl EvictionJudgeFactory for EvictionController {
    fn create_judge(&self) -> Result<Box<dyn EvictionJudge>> {
        let required = self.archives_of_active_requests()?;
        let pinned = self
            .topology
            .partitions()
            .into_iter()
            .filter(|p| self.topology.is_pinned_forever(p))
            .collect();
        debug!(
            "Eviction judge: {} archives required by access requests",
            required.len()
        );
        Ok(Box::new(Judge {
            locks: Arc::clone(&self.locks),
            required,
            pinned,
        }))
    }
}

struct Judge {
    /// Live view, so locks taken during the pass are honoured
    locks: LockCounts,
    required: HashSet<ArchiveId>,
    pinned: HashSet<String>,
}

impl EvictionJudge for Judge {
    fn can_evict(&self, key: &ArchiveKey) -> bool {
        !self.pinned.contains(&key.partition_id)
            && !self.required.contains(&key.archive_id)
            && !self.locks.contains_key(&key.archive_id)
    }
}

/// Releases its eviction locks when dropped
pub struct EvictionLockGuard {
    locks: LockCounts,
    archive_ids: Vec<ArchiveId>,
}

impl Drop for EvictionLockGuard {
    fn drop(&mut self) {
        for id in &self.archive_ids {
            if let Entry::Occupied(mut entry) = self.locks.entry(id.clone()) {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
        }
    }
}
