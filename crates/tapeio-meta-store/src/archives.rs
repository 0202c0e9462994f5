//! Archive location records
//!
//! An archive only ever moves forward: BuildingOnDisk, then ReadyOnDisk,
//! then OnTape. Every transition is a conditional write on the current
//! location so a stale writer can never move a record backwards.

use crate::store::{MetaStore, MetaStoreResult};
use crate::tables;
use chrono::Utc;
use tapeio_common::{ArchiveEntry, ArchiveId, ArchiveLocation};

impl MetaStore {
    /// Insert the record of a new archive. Fails if the id already exists.
    pub fn insert_archive(&self, archive: &ArchiveEntry) -> MetaStoreResult<()> {
        self.insert_new_bincode(
            tables::ARCHIVES,
            "archives",
            archive.archive_id.as_str(),
            archive,
        )
    }

    pub fn find_archive(&self, archive_id: &ArchiveId) -> MetaStoreResult<Option<ArchiveEntry>> {
        self.get_bincode(tables::ARCHIVES, archive_id.as_str())
    }

    /// Look up many archives. Unknown ids are skipped.
    pub fn bulk_find_archives(&self, archive_ids: &[ArchiveId]) -> MetaStoreResult<Vec<ArchiveEntry>> {
        let keys: Vec<String> = archive_ids.iter().map(|id| id.as_str().to_string()).collect();
        self.bulk_get_bincode(tables::ARCHIVES, &keys)
    }

    /// BuildingOnDisk -> ReadyOnDisk, recording size and digest.
    /// Returns `false` if the archive is unknown or not building anymore.
    pub fn mark_archive_ready(
        &self,
        archive_id: &ArchiveId,
        size: u64,
        digest: &str,
    ) -> MetaStoreResult<bool> {
        self.update_bincode::<ArchiveEntry, _>(tables::ARCHIVES, archive_id.as_str(), |archive| {
            if archive.location != ArchiveLocation::BuildingOnDisk {
                return false;
            }
            archive.location = ArchiveLocation::ReadyOnDisk;
            archive.size = Some(size);
            archive.digest = Some(digest.to_string());
            archive.last_updated = Utc::now();
            true
        })
    }

    /// ReadyOnDisk -> OnTape.
    /// Returns `false` if the archive is unknown or not ready.
    pub fn mark_archive_on_tape(
        &self,
        archive_id: &ArchiveId,
        tape_code: &str,
        file_position: u32,
    ) -> MetaStoreResult<bool> {
        self.update_bincode::<ArchiveEntry, _>(tables::ARCHIVES, archive_id.as_str(), |archive| {
            if archive.location != ArchiveLocation::ReadyOnDisk {
                return false;
            }
            archive.location = ArchiveLocation::OnTape {
                tape_code: tape_code.to_string(),
                file_position,
            };
            archive.last_updated = Utc::now();
            true
        })
    }
}
