//! Object storage backed by archives
//!
//! Writes land in loose storage and are handed to the aggregation worker
//! of their partition. Reads follow the object to wherever its bytes live
//! right now: the loose file, an archive in the input tars directory, or
//! an archive staged into the cache.

use crate::access::AccessRequestManager;
use crate::aggregator::{AggregatorClient, ArchiverContext, InputFileMessage, entry_sizes};
use crate::eviction::{EvictionController, EvictionLockGuard};
use crate::retry::{Attempt, retry_on_conflict};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapeio_archive::format::MAX_ENTRY_NAME_LEN;
use tapeio_archive::open_entry;
use tapeio_cache::ArchiveCache;
use tapeio_common::{
    AccessRequestId, AccessRequestStatus, ArchiveEntry, ArchiveId, ArchiveLocation, DigestAlgorithm,
    DigestWithSize, EntryName, Error, ObjectEntry, ObjectLocation, Result, TarEntryDescription,
    is_safe_path_segment, new_storage_id,
};
use tracing::{debug, info, warn};

/// Public view of a stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub container: String,
    pub object_name: String,
    pub size: u64,
    pub digest_algorithm: DigestAlgorithm,
    pub digest: String,
    pub last_modified: DateTime<Utc>,
}

impl From<&ObjectEntry> for ObjectMetadata {
    fn from(object: &ObjectEntry) -> Self {
        Self {
            container: object.container.clone(),
            object_name: object.object_name.clone(),
            size: object.size,
            digest_algorithm: object.digest_algorithm,
            digest: object.digest.clone(),
            last_modified: object.last_modified,
        }
    }
}

/// Streams the bytes of one object
///
/// Archives the object is read from stay in the cache until the reader is
/// dropped.
pub struct ObjectReader {
    metadata: ObjectMetadata,
    parts: VecDeque<Box<dyn Read + Send>>,
    _lock: Option<EvictionLockGuard>,
}

impl ObjectReader {
    pub const fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(part) = self.parts.front_mut() {
            let n = part.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.parts.pop_front();
        }
        Ok(0)
    }
}

/// Entry point of the offer for object reads, writes and access requests
pub struct TapeObjectStorage {
    ctx: Arc<ArchiverContext>,
    cache: Arc<ArchiveCache>,
    eviction: Arc<EvictionController>,
    access: Arc<AccessRequestManager>,
    aggregator: AggregatorClient,
}

impl TapeObjectStorage {
    pub fn new(
        ctx: Arc<ArchiverContext>,
        cache: Arc<ArchiveCache>,
        eviction: Arc<EvictionController>,
        access: Arc<AccessRequestManager>,
        aggregator: AggregatorClient,
    ) -> Self {
        Self {
            ctx,
            cache,
            eviction,
            access,
            aggregator,
        }
    }

    fn check_object_name(&self, container: &str, object_name: &str, size: u64) -> Result<()> {
        if !is_safe_path_segment(object_name) {
            return Err(Error::bad_request(format!("invalid object name {object_name:?}")));
        }
        let entry_count = entry_sizes(size, self.ctx.archive.max_entry_size).len();
        let last_index = u32::try_from(entry_count.saturating_sub(1))
            .map_err(|_| Error::bad_request(format!("object {object_name} is too large")))?;
        let longest = EntryName::new(container, new_storage_id(object_name), last_index).to_string();
        if longest.len() > MAX_ENTRY_NAME_LEN {
            return Err(Error::bad_request(format!(
                "object name {object_name:?} is too long for container {container}"
            )));
        }
        Ok(())
    }

    fn find(&self, container: &str, object_name: &str) -> Result<ObjectEntry> {
        self.ctx
            .store
            .find_object(container, object_name)?
            .ok_or_else(|| Error::not_found(format!("object {container}/{object_name}")))
    }

    /// Store exactly `size` bytes from `reader` as `container/object_name`,
    /// replacing any previous version. Returns the digest of the bytes.
    pub fn write_object(
        &self,
        container: &str,
        object_name: &str,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<DigestWithSize> {
        self.ctx.topology.partition_of(container)?;
        self.check_object_name(container, object_name, size)?;

        let stored = self.ctx.loose.write(container, object_name, reader, size)?;
        let previous = self.ctx.store.find_object(container, object_name)?;
        let now = Utc::now();
        self.ctx.store.put_object(&ObjectEntry {
            container: container.to_string(),
            object_name: object_name.to_string(),
            storage_id: stored.storage_id.clone(),
            size: stored.digest.size,
            digest_algorithm: DigestAlgorithm::Sha512,
            digest: stored.digest.digest.clone(),
            location: ObjectLocation::InputFile,
            last_access: now,
            last_modified: now,
        })?;
        if let Some(previous) = previous {
            if previous.location == ObjectLocation::InputFile {
                self.delete_loose_file(container, &previous.storage_id);
            }
        }

        self.aggregator.submit(InputFileMessage {
            container: container.to_string(),
            object_name: object_name.to_string(),
            storage_id: stored.storage_id,
        })?;
        debug!("Stored {container}/{object_name} ({size} bytes)");
        Ok(stored.digest)
    }

    fn delete_loose_file(&self, container: &str, storage_id: &str) {
        if let Err(e) = self.ctx.loose.delete(container, storage_id) {
            warn!("Failed to delete input file {container}/{storage_id}: {e}");
        }
    }

    /// Open an object for reading.
    ///
    /// Fails with `NotFound` for an unknown object and with `Unavailable`
    /// when one of its archives is only on tape.
    pub fn get_object(&self, container: &str, object_name: &str) -> Result<ObjectReader> {
        retry_on_conflict(&self.ctx.retry, "object read", || {
            let object = self.find(container, object_name)?;
            match &object.location {
                ObjectLocation::InputFile => match self.ctx.loose.read(container, &object.storage_id)? {
                    Some(file) => Ok(Attempt::Done(ObjectReader {
                        metadata: ObjectMetadata::from(&object),
                        parts: VecDeque::from([Box::new(file) as Box<dyn Read + Send>]),
                        _lock: None,
                    })),
                    // archived or deleted since the lookup
                    None => Ok(Attempt::Conflict),
                },
                ObjectLocation::InTar(entries) => self.open_archived(&object, entries),
            }
        })
    }

    fn open_archived(
        &self,
        object: &ObjectEntry,
        entries: &[TarEntryDescription],
    ) -> Result<Attempt<ObjectReader>> {
        let archive_ids = object.location.archive_ids();
        let lock = self.eviction.lock(archive_ids.iter().cloned());

        let archives: HashMap<ArchiveId, ArchiveEntry> = self
            .ctx
            .store
            .bulk_find_archives(&archive_ids)?
            .into_iter()
            .map(|a| (a.archive_id.clone(), a))
            .collect();
        let mut parts: VecDeque<Box<dyn Read + Send>> = VecDeque::with_capacity(entries.len());
        for entry in entries {
            let archive = archives.get(&entry.archive_id).ok_or_else(|| {
                Error::referential(format!(
                    "object {}/{} refers to unknown archive {}",
                    object.container, object.object_name, entry.archive_id
                ))
            })?;
            let Some(file) = self.open_archive_file(archive)? else {
                if !matches!(archive.location, ArchiveLocation::OnTape { .. }) {
                    // moved on since the archive record was read
                    return Ok(Attempt::Conflict);
                }
                return Err(Error::Unavailable(format!(
                    "object {}/{}: archive {} is not on disk",
                    object.container, object.object_name, entry.archive_id
                )));
            };
            parts.push_back(Box::new(open_entry(file, entry)?));
        }
        Ok(Attempt::Done(ObjectReader {
            metadata: ObjectMetadata::from(object),
            parts,
            _lock: Some(lock),
        }))
    }

    /// The archive file wherever it is on disk, looked up in the order files
    /// move: being built, sealed, then cached.
    fn open_archive_file(&self, archive: &ArchiveEntry) -> Result<Option<File>> {
        let dir = self.ctx.partition_dir(&archive.partition_id);
        if let Some(file) = open_first_existing(archive_file_candidates(&dir, &archive.archive_id))? {
            return Ok(Some(file));
        }
        self.cache.try_read(&archive.partition_id, &archive.archive_id)
    }

    /// Delete an object. Returns `false` if it did not exist.
    pub fn delete_object(&self, container: &str, object_name: &str) -> Result<bool> {
        let Some(object) = self.ctx.store.find_object(container, object_name)? else {
            return Ok(false);
        };
        let deleted = self
            .ctx
            .store
            .delete_object(container, object_name, Some(&object.storage_id))?;
        if deleted {
            if object.location == ObjectLocation::InputFile {
                self.delete_loose_file(container, &object.storage_id);
            }
            info!("Deleted {container}/{object_name}");
        }
        Ok(deleted)
    }

    pub fn is_existing_object(&self, container: &str, object_name: &str) -> Result<bool> {
        Ok(self.ctx.store.find_object(container, object_name)?.is_some())
    }

    pub fn get_object_digest(&self, container: &str, object_name: &str) -> Result<String> {
        Ok(self.find(container, object_name)?.digest)
    }

    pub fn get_object_metadata(&self, container: &str, object_name: &str) -> Result<ObjectMetadata> {
        Ok(ObjectMetadata::from(&self.find(container, object_name)?))
    }

    pub fn list_container(&self, container: &str) -> Result<Vec<ObjectMetadata>> {
        self.ctx.topology.partition_of(container)?;
        Ok(self
            .ctx
            .store
            .list_objects(container)?
            .iter()
            .map(ObjectMetadata::from)
            .collect())
    }

    pub fn create_access_request(
        &self,
        container: &str,
        object_names: &[String],
        tenant: u32,
    ) -> Result<AccessRequestId> {
        self.access.create(container, object_names, tenant)
    }

    pub fn check_access_request_statuses(
        &self,
        request_ids: &[AccessRequestId],
        tenant: u32,
    ) -> Result<Vec<(AccessRequestId, AccessRequestStatus)>> {
        self.access.check_statuses(request_ids, tenant)
    }

    pub fn remove_access_request(&self, request_id: &AccessRequestId, tenant: u32) -> Result<()> {
        self.access.remove(request_id, tenant)
    }

    pub fn check_object_availability(&self, container: &str, object_names: &[String]) -> Result<bool> {
        self.access.check_object_availability(container, object_names)
    }
}

/// Paths an archive of the input tars directory goes through, in order
fn archive_file_candidates(dir: &Path, archive_id: &ArchiveId) -> [PathBuf; 2] {
    [dir.join(archive_id.temp_file_name()), dir.join(archive_id.as_str())]
}

fn open_first_existing(paths: impl IntoIterator<Item = PathBuf>) -> io::Result<Option<File>> {
    for path in paths {
        match File::open(&path) {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loose::LooseObjectStore;
    use crate::aggregator::PartitionArchiver;
    use crate::staging::ArchiveStaging;
    use crate::test_support::{Fixture, PARTITION};
    use std::fs;
    use tapeio_common::QueueOrder;
    use tapeio_common::config::ArchiveConfig;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        fx: Fixture,
        storage: TapeObjectStorage,
        submitted: UnboundedReceiver<InputFileMessage>,
        archiver: PartitionArchiver,
    }

    impl Harness {
        fn new(fx: Fixture) -> Self {
            let (client, submitted) = AggregatorClient::detached(Arc::clone(&fx.topology));
            let storage = TapeObjectStorage::new(
                fx.archiver_context(),
                Arc::clone(&fx.cache),
                Arc::clone(&fx.eviction),
                Arc::clone(&fx.access),
                client,
            );
            let archiver = PartitionArchiver::new(fx.archiver_context(), PARTITION);
            Self {
                fx,
                storage,
                submitted,
                archiver,
            }
        }

        /// Aggregate everything submitted so far and seal the archive
        fn archive_pending(&mut self) -> Option<ArchiveId> {
            while let Ok(msg) = self.submitted.try_recv() {
                self.archiver.process(&msg).unwrap();
            }
            self.archiver.seal_current().unwrap()
        }

        fn write(&self, name: &str, data: &[u8]) -> DigestWithSize {
            self.storage
                .write_object("c", name, &mut &data[..], data.len() as u64)
                .unwrap()
        }

        fn read(&self, name: &str) -> Vec<u8> {
            let mut out = Vec::new();
            self.storage.get_object("c", name).unwrap().read_to_end(&mut out).unwrap();
            out
        }

        /// Move a sealed archive to tape, leaving no local copy
        fn send_to_tape(&self, archive_id: &ArchiveId, file_position: u32) -> Vec<u8> {
            let path = self.fx.input_tars_dir().join(PARTITION).join(archive_id.as_str());
            let bytes = fs::read(&path).unwrap();
            assert!(self.fx.store.mark_archive_on_tape(archive_id, "TAPE01", file_position).unwrap());
            fs::remove_file(path).unwrap();
            bytes
        }
    }

    #[test]
    fn test_write_then_read_loose_object() {
        let h = Harness::new(Fixture::new());
        let digest = h.write("o1", b"hello world");
        assert_eq!(digest.size, 11);
        assert_eq!(h.read("o1"), b"hello world");
        assert_eq!(h.storage.get_object_digest("c", "o1").unwrap(), digest.digest);
        assert!(h.storage.is_existing_object("c", "o1").unwrap());
        let metadata = h.storage.get_object_metadata("c", "o1").unwrap();
        assert_eq!(metadata.size, 11);
    }

    #[test]
    fn test_invalid_writes_are_rejected() {
        let h = Harness::new(Fixture::new());
        let err = h.storage.write_object("nope", "o1", &mut &b"x"[..], 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = h.storage.write_object("c", "../o1", &mut &b"x"[..], 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let long = "o".repeat(80);
        let err = h.storage.write_object("c", &long, &mut &b"x"[..], 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        // short stream
        let err = h.storage.write_object("c", "o1", &mut &b"x"[..], 2).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(!h.storage.is_existing_object("c", "o1").unwrap());
    }

    #[test]
    fn test_overwrite_drops_previous_loose_file() {
        let h = Harness::new(Fixture::new());
        h.write("o1", b"first");
        let first = h.fx.store.find_object("c", "o1").unwrap().unwrap();
        h.write("o1", b"second");
        assert!(h.fx.loose.read("c", &first.storage_id).unwrap().is_none());
        assert_eq!(h.read("o1"), b"second");
    }

    #[test]
    fn test_read_object_split_across_archives() {
        let mut h = Harness::new(Fixture::with_archive_config(ArchiveConfig {
            max_archive_size: 5000,
            max_entry_size: 1000,
            buffering_timeout_secs: 60,
        }));
        let data = h.fx.random_bytes(2500);
        h.write("big", &data);
        h.archive_pending();

        let object = h.fx.store.find_object("c", "big").unwrap().unwrap();
        assert!(object.location.archive_ids().len() > 1);
        assert_eq!(h.read("big"), data);
    }

    #[test]
    fn test_read_from_building_archive() {
        let mut h = Harness::new(Fixture::new());
        h.write("o1", b"payload");
        let msg = h.submitted.try_recv().unwrap();
        h.archiver.process(&msg).unwrap();
        let archive_id = h.archiver.current_archive().cloned().unwrap();
        assert_eq!(
            h.fx.store.find_archive(&archive_id).unwrap().unwrap().location,
            ArchiveLocation::BuildingOnDisk
        );
        assert_eq!(h.read("o1"), b"payload");
    }

    #[test]
    fn test_archive_lookup_survives_concurrent_seal() {
        let archive_id = ArchiveId::new_unchecked("a.tar");
        // the seal renames the file just before each of the lookups
        for seal_before in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let temp = dir.path().join(archive_id.temp_file_name());
            let sealed = dir.path().join(archive_id.as_str());
            fs::write(&temp, b"archive bytes").unwrap();

            let candidates = archive_file_candidates(dir.path(), &archive_id)
                .into_iter()
                .enumerate()
                .map(|(i, path)| {
                    if i == seal_before {
                        fs::rename(&temp, &sealed).unwrap();
                    }
                    path
                });
            let mut content = String::new();
            open_first_existing(candidates)
                .unwrap()
                .unwrap()
                .read_to_string(&mut content)
                .unwrap();
            assert_eq!(content, "archive bytes");
        }
    }

    #[test]
    fn test_missing_sealed_archive_is_retried_not_unavailable() {
        let mut h = Harness::new(Fixture::new());
        h.write("o1", b"abc");
        let archive_id = h.archive_pending().unwrap();
        let path = h.fx.input_tars_dir().join(PARTITION).join(archive_id.as_str());
        fs::remove_file(path).unwrap();

        // the record still says ReadyOnDisk, so the read waits for the file to settle
        let err = h.storage.get_object("c", "o1").err().unwrap();
        assert!(matches!(err, Error::Concurrency(_)));
    }

    #[test]
    fn test_object_on_tape_is_unavailable_until_staged() {
        let mut h = Harness::new(Fixture::new());
        let data = h.fx.random_bytes(3000);
        h.write("o1", &data);
        let archive_id = h.archive_pending().unwrap();
        let bytes = h.send_to_tape(&archive_id, 3);

        let err = h.storage.get_object("c", "o1").err().unwrap();
        assert!(matches!(err, Error::Unavailable(_)));

        let staging = ArchiveStaging::new(
            Arc::clone(&h.fx.store),
            Arc::clone(&h.fx.cache),
            Arc::clone(&h.fx.access),
            h.fx.input_tars_dir(),
        );
        staging.begin_fetch(&archive_id).unwrap();
        let staged = h.fx.scratch_dir().join("fetched");
        fs::write(&staged, &bytes).unwrap();
        staging.complete_fetch(&staged, &archive_id).unwrap();

        let reader = h.storage.get_object("c", "o1").unwrap();
        assert!(h.fx.eviction.is_locked(&archive_id));
        drop(reader);
        assert!(!h.fx.eviction.is_locked(&archive_id));
        assert_eq!(h.read("o1"), data);
    }

    #[test]
    fn test_written_archive_moves_into_cache() {
        let mut h = Harness::new(Fixture::new());
        h.write("o1", b"abc");
        let archive_id = h.archive_pending().unwrap();
        let staging = ArchiveStaging::new(
            Arc::clone(&h.fx.store),
            Arc::clone(&h.fx.cache),
            Arc::clone(&h.fx.access),
            h.fx.input_tars_dir(),
        );
        staging.on_archive_written(&archive_id, "TAPE01", 1).unwrap();
        // repeated notification
        staging.on_archive_written(&archive_id, "TAPE01", 1).unwrap();

        assert!(h.fx.cache.contains(PARTITION, &archive_id));
        assert!(!h.fx.input_tars_dir().join(PARTITION).join(archive_id.as_str()).exists());
        assert_eq!(h.read("o1"), b"abc");
    }

    #[test]
    fn test_access_request_end_to_end() {
        let mut h = Harness::new(Fixture::new());
        let data = h.fx.random_bytes(10 * 1024 * 1024);
        h.write("o1", &data);
        let archive_id = h.archive_pending().unwrap();
        let bytes = h.send_to_tape(&archive_id, 7);
        let names = vec!["o1".to_string()];
        assert!(!h.storage.check_object_availability("c", &names).unwrap());

        let request_id = h.storage.create_access_request("c", &names, 1).unwrap();
        let request = h.fx.store.find_access_request(&request_id).unwrap().unwrap();
        assert_eq!(request.unavailable_archive_ids.len(), 1);
        let read_orders: Vec<_> = h
            .fx
            .store
            .list_orders()
            .unwrap()
            .into_iter()
            .filter_map(|o| match o.order {
                QueueOrder::Read(r) => Some(r),
                QueueOrder::Write(_) => None,
            })
            .collect();
        assert_eq!(read_orders.len(), 1);
        assert_eq!(read_orders[0].archive_id, archive_id);
        assert_eq!(read_orders[0].file_position, 7);
        assert_eq!(read_orders[0].bucket_id, "bucket");

        let staging = ArchiveStaging::new(
            Arc::clone(&h.fx.store),
            Arc::clone(&h.fx.cache),
            Arc::clone(&h.fx.access),
            h.fx.input_tars_dir(),
        );
        staging.begin_fetch(&archive_id).unwrap();
        let staged = h.fx.scratch_dir().join("fetched");
        fs::write(&staged, &bytes).unwrap();
        staging.complete_fetch(&staged, &archive_id).unwrap();

        let statuses = h
            .storage
            .check_access_request_statuses(std::slice::from_ref(&request_id), 1)
            .unwrap();
        assert_eq!(statuses, vec![(request_id.clone(), AccessRequestStatus::Ready)]);
        assert!(h.storage.check_object_availability("c", &names).unwrap());
        assert_eq!(h.read("o1"), data);

        h.storage.remove_access_request(&request_id, 1).unwrap();
        let statuses = h
            .storage
            .check_access_request_statuses(std::slice::from_ref(&request_id), 1)
            .unwrap();
        assert_eq!(statuses[0].1, AccessRequestStatus::NotFound);
    }

    #[test]
    fn test_aborted_fetch_releases_space() {
        let mut h = Harness::new(Fixture::new());
        h.write("o1", b"abc");
        let archive_id = h.archive_pending().unwrap();
        h.send_to_tape(&archive_id, 1);
        let staging = ArchiveStaging::new(
            Arc::clone(&h.fx.store),
            Arc::clone(&h.fx.cache),
            Arc::clone(&h.fx.access),
            h.fx.input_tars_dir(),
        );
        staging.begin_fetch(&archive_id).unwrap();
        assert!(h.fx.cache.is_reserved(PARTITION, &archive_id));
        assert!(h.fx.cache.current_usage() > 0);
        staging.abort_fetch(&archive_id).unwrap();
        assert_eq!(h.fx.cache.current_usage(), 0);
    }

    #[test]
    fn test_delete_and_list() {
        let mut h = Harness::new(Fixture::new());
        h.write("o1", b"one");
        h.write("o2", b"two");
        h.archive_pending();
        h.write("o3", b"three");

        let mut names: Vec<String> = h
            .storage
            .list_container("c")
            .unwrap()
            .into_iter()
            .map(|m| m.object_name)
            .collect();
        names.sort();
        assert_eq!(names, ["o1", "o2", "o3"]);

        let loose = h.fx.store.find_object("c", "o3").unwrap().unwrap();
        assert!(h.storage.delete_object("c", "o3").unwrap());
        assert!(h.fx.loose.read("c", &loose.storage_id).unwrap().is_none());
        assert!(h.storage.delete_object("c", "o1").unwrap());
        assert!(!h.storage.delete_object("c", "o1").unwrap());
        assert!(h.storage.get_object("c", "o1").err().unwrap().is_not_found());
        assert!(h.storage.list_container("c2").unwrap().is_empty());
    }
}
