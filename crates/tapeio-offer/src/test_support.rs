//! Shared fixture of the crate tests

use crate::access::AccessRequestManager;
use crate::aggregator::{ArchiverContext, InputFileMessage};
use crate::eviction::EvictionController;
use crate::loose::{FsLooseObjectStore, LooseObjectStore};
use crate::retry::RetryPolicy;
use chrono::Utc;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use tapeio_cache::ArchiveCache;
use tapeio_common::config::{ArchiveConfig, BucketConfig, CacheConfig, PartitionConfig, TopologyConfig};
use tapeio_common::{
    ArchiveEntry, ArchiveId, ArchiveLocation, DigestAlgorithm, ObjectEntry, ObjectLocation, OfferConfig,
    OrderQueue, StaticTopology, TarEntryDescription, TopologyResolver,
};
use tapeio_meta_store::MetaStore;
use tempfile::TempDir;

/// Partition of containers `c` and `c2`
pub const PARTITION: &str = "p1";

/// Size of the archives made up by [`Fixture::put_archived_object`]
pub const FAKE_ARCHIVE_SIZE: u64 = 4096;

pub struct Fixture {
    pub config: OfferConfig,
    pub store: Arc<MetaStore>,
    pub loose: Arc<FsLooseObjectStore>,
    pub topology: Arc<dyn TopologyResolver>,
    pub cache: Arc<ArchiveCache>,
    pub eviction: Arc<EvictionController>,
    pub access: Arc<AccessRequestManager>,
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_archive_config(ArchiveConfig::default())
    }

    pub fn with_archive_config(archive: ArchiveConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OfferConfig::default();
        config.storage.input_files_dir = dir.path().join("inputFiles");
        config.storage.input_tars_dir = dir.path().join("inputTars");
        config.storage.cache_dir = dir.path().join("tarCache");
        config.storage.meta_db_path = dir.path().join("meta.redb");
        config.archive = archive;
        config.cache = CacheConfig {
            max_capacity_bytes: 100 * 1024 * 1024,
            eviction_threshold_bytes: 80 * 1024 * 1024,
            safe_threshold_bytes: 50 * 1024 * 1024,
        };
        // distinct from the tenants used by the tests
        config.access_request.admin_tenant = 99;
        config.access_request.max_objects_per_request = 10;
        config.topology = TopologyConfig {
            buckets: vec![
                BucketConfig {
                    id: "bucket".into(),
                    keep_forever_in_cache: false,
                    partitions: vec![PartitionConfig {
                        id: PARTITION.into(),
                        containers: vec!["c".into(), "c2".into()],
                    }],
                },
                BucketConfig {
                    id: "pinned-bucket".into(),
                    keep_forever_in_cache: true,
                    partitions: vec![PartitionConfig {
                        id: "p2".into(),
                        containers: vec!["pinned".into()],
                    }],
                },
            ],
        };
        config.validate().unwrap();

        let store = Arc::new(MetaStore::open(&config.storage.meta_db_path).unwrap());
        let loose = Arc::new(FsLooseObjectStore::new(&config.storage.input_files_dir).unwrap());
        let topology: Arc<dyn TopologyResolver> = Arc::new(StaticTopology::from_config(&config.topology));
        let eviction = Arc::new(EvictionController::new(Arc::clone(&store), Arc::clone(&topology)));
        let cache = Arc::new(
            ArchiveCache::open(
                &config.storage.cache_dir,
                topology.partitions(),
                &config.cache,
                eviction.clone(),
            )
            .unwrap(),
        );
        let access = Self::access_manager(&config, &store, &cache, &topology);
        Self {
            config,
            store,
            loose,
            topology,
            cache,
            eviction,
            access,
            dir,
        }
    }

    fn access_manager(
        config: &OfferConfig,
        store: &Arc<MetaStore>,
        cache: &Arc<ArchiveCache>,
        topology: &Arc<dyn TopologyResolver>,
    ) -> Arc<AccessRequestManager> {
        Arc::new(
            AccessRequestManager::new(
                Arc::clone(store),
                Arc::clone(cache),
                Arc::clone(store) as Arc<dyn OrderQueue>,
                Arc::clone(topology),
                config.access_request.clone(),
                2,
            )
            .with_retry_policy(RetryPolicy::immediate(3)),
        )
    }

    /// Pick up changes made to `config.access_request`
    pub fn rebuild_access_manager(&mut self) {
        self.access = Self::access_manager(&self.config, &self.store, &self.cache, &self.topology);
    }

    pub fn archiver_context(&self) -> Arc<ArchiverContext> {
        Arc::new(ArchiverContext {
            store: Arc::clone(&self.store),
            loose: Arc::clone(&self.loose) as Arc<dyn LooseObjectStore>,
            queue: Arc::clone(&self.store) as Arc<dyn OrderQueue>,
            topology: Arc::clone(&self.topology),
            input_tars_dir: self.input_tars_dir(),
            archive: self.config.archive.clone(),
            retry: RetryPolicy::immediate(3),
        })
    }

    pub fn input_tars_dir(&self) -> PathBuf {
        self.config.storage.input_tars_dir.clone()
    }

    pub fn scratch_dir(&self) -> PathBuf {
        let scratch = self.dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        scratch
    }

    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// Store a loose file and its `InputFile` record, as a client write does
    pub fn put_input_object(&self, container: &str, name: &str, data: &[u8]) -> InputFileMessage {
        let stored = self.loose.write(container, name, &mut &data[..], data.len() as u64).unwrap();
        let now = Utc::now();
        self.store
            .put_object(&ObjectEntry {
                container: container.into(),
                object_name: name.into(),
                storage_id: stored.storage_id.clone(),
                size: stored.digest.size,
                digest_algorithm: DigestAlgorithm::Sha512,
                digest: stored.digest.digest,
                location: ObjectLocation::InputFile,
                last_access: now,
                last_modified: now,
            })
            .unwrap();
        InputFileMessage {
            container: container.into(),
            object_name: name.into(),
            storage_id: stored.storage_id,
        }
    }

    /// Record an object held by one entry of `archive_id`, without any file
    pub fn put_object_in(&self, container: &str, name: &str, archive_id: &ArchiveId) {
        let now = Utc::now();
        self.store
            .put_object(&ObjectEntry {
                container: container.into(),
                object_name: name.into(),
                storage_id: tapeio_common::new_storage_id(name),
                size: 1,
                digest_algorithm: DigestAlgorithm::Sha512,
                digest: String::new(),
                location: ObjectLocation::InTar(vec![TarEntryDescription {
                    archive_id: archive_id.clone(),
                    entry_name: format!("{container}/{name}-0"),
                    start_offset: 0,
                    size: 1,
                    entry_digest: String::new(),
                }]),
                last_access: now,
                last_modified: now,
            })
            .unwrap();
    }

    /// Record an object held by a fresh archive at `location`
    pub fn put_archived_object(&self, container: &str, name: &str, location: ArchiveLocation) -> ArchiveId {
        let archive_id = ArchiveId::generate();
        let mut archive = ArchiveEntry::building(archive_id.clone(), self.topology.partition_of(container).unwrap());
        archive.location = location;
        archive.size = Some(FAKE_ARCHIVE_SIZE);
        archive.digest = Some("digest".into());
        self.store.insert_archive(&archive).unwrap();
        self.put_object_in(container, name, &archive_id);
        archive_id
    }

    pub fn on_tape(file_position: u32) -> ArchiveLocation {
        ArchiveLocation::OnTape {
            tape_code: format!("TAPE{file_position:04}"),
            file_position,
        }
    }

    /// Put a placeholder file for an archive into the cache, as a tape read does
    pub fn stage_into_cache(&self, archive_id: &ArchiveId) {
        let archive = self.store.find_archive(archive_id).unwrap().unwrap();
        let size = archive.size.unwrap();
        let source = self.scratch_dir().join(archive_id.as_str());
        std::fs::write(&source, vec![0u8; usize::try_from(size).unwrap()]).unwrap();
        self.cache.reserve(&archive.partition_id, archive_id, size).unwrap();
        self.cache
            .move_to_cache(&source, &archive.partition_id, archive_id)
            .unwrap();
    }
}
