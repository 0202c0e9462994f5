//! Archive movements reported by the tape subsystem
//!
//! Two events matter to the offer:
//! - an archive was written to tape: it moves from the input directory
//!   into the disk cache (or is dropped if the cache is full);
//! - an archive was read back from tape: space is reserved before the
//!   transfer, the file is committed into the cache afterwards, and the
//!   access requests waiting for it are updated.

use crate::access::AccessRequestManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tapeio_cache::ArchiveCache;
use tapeio_common::{ArchiveEntry, ArchiveId, ArchiveLocation, Error, Result};
use tapeio_meta_store::MetaStore;
use tracing::{info, warn};

/// Move an archive already safe on tape into the cache.
///
/// A cache without room for it is not an error: the local copy is simply
/// dropped, tape holds the data.
pub(crate) fn store_written_archive(
    cache: &ArchiveCache,
    path: &Path,
    partition_id: &str,
    archive_id: &ArchiveId,
) -> Result<()> {
    let size = fs::metadata(path)?.len();
    if let Err(e) = cache.reserve(partition_id, archive_id, size) {
        warn!("No room in the cache for archive {partition_id}/{archive_id}, dropping the local copy: {e}");
        fs::remove_file(path)?;
        return Ok(());
    }
    if let Err(e) = cache.move_to_cache(path, partition_id, archive_id) {
        if let Err(cancel) = cache.cancel_reservation(partition_id, archive_id) {
            warn!("Failed to release reservation of {partition_id}/{archive_id}: {cancel}");
        }
        return Err(e);
    }
    Ok(())
}

/// Handles archive movements between disk and tape
pub struct ArchiveStaging {
    store: Arc<MetaStore>,
    cache: Arc<ArchiveCache>,
    access: Arc<AccessRequestManager>,
    input_tars_dir: PathBuf,
}

impl ArchiveStaging {
    pub fn new(
        store: Arc<MetaStore>,
        cache: Arc<ArchiveCache>,
        access: Arc<AccessRequestManager>,
        input_tars_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            cache,
            access,
            input_tars_dir: input_tars_dir.into(),
        }
    }

    fn archive(&self, archive_id: &ArchiveId) -> Result<ArchiveEntry> {
        self.store
            .find_archive(archive_id)?
            .ok_or_else(|| Error::not_found(format!("archive {archive_id}")))
    }

    /// The archive is now on tape at `(tape_code, file_position)`
    pub fn on_archive_written(&self, archive_id: &ArchiveId, tape_code: &str, file_position: u32) -> Result<()> {
        let archive = self.archive(archive_id)?;
        if !self.store.mark_archive_on_tape(archive_id, tape_code, file_position)? {
            if !matches!(archive.location, ArchiveLocation::OnTape { .. }) {
                return Err(Error::illegal_state(format!(
                    "archive {archive_id} cannot go on tape from {}",
                    archive.location.name()
                )));
            }
            // repeated notification
            return Ok(());
        }
        info!("Archive {archive_id} written to tape {tape_code} at position {file_position}");
        let path = self
            .input_tars_dir
            .join(&archive.partition_id)
            .join(archive_id.as_str());
        store_written_archive(&self.cache, &path, &archive.partition_id, archive_id)
    }

    /// Reserve cache space before reading an archive back from tape
    pub fn begin_fetch(&self, archive_id: &ArchiveId) -> Result<()> {
        let archive = self.archive(archive_id)?;
        let size = archive
            .size
            .ok_or_else(|| Error::illegal_state(format!("archive {archive_id} has no recorded size")))?;
        self.cache.reserve(&archive.partition_id, archive_id, size)
    }

    /// Commit an archive read back from tape into `source`
    pub fn complete_fetch(&self, source: &Path, archive_id: &ArchiveId) -> Result<()> {
        let archive = self.archive(archive_id)?;
        self.cache.move_to_cache(source, &archive.partition_id, archive_id)?;
        self.access.on_archive_ready(archive_id)
    }

    /// Release the reservation of a failed read
    pub fn abort_fetch(&self, archive_id: &ArchiveId) -> Result<()> {
        let archive = self.archive(archive_id)?;
        warn!("Fetch of archive {archive_id} aborted");
        self.cache.cancel_reservation(&archive.partition_id, archive_id)
    }
}
