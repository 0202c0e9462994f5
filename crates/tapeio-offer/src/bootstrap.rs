//! Crash recovery at startup
//!
//! Recovery is split in two: pure planners map a directory listing plus a
//! snapshot of the metadata store to a list of actions, and executors run
//! those actions against the real filesystem and store.
//!
//! Archive directories (`{inputTars}/{partition}`):
//!
//! | file            | archive record           | action                               |
//! |-----------------|--------------------------|--------------------------------------|
//! | `{id}.tmp`      | `BuildingOnDisk`         | repair, verify, mark ready, queue    |
//! | `{id}.tmp`      | ready or on tape         | delete                               |
//! | `{id}`          | `BuildingOnDisk`         | verify, mark ready, queue            |
//! | `{id}`          | `ReadyOnDisk`            | queue the write order again          |
//! | `{id}`          | `OnTape`, not cached     | move into the cache                  |
//! | `{id}`          | `OnTape`, cached         | delete                               |
//! | `*.spool`       | any                      | delete (interrupted repair)          |
//! | anything        | unknown                  | fatal                                |
//!
//! Input files (`{inputFiles}/{container}`) are deleted unless their object
//! still waits for aggregation, in which case they are checked and queued.

use crate::aggregator::{ArchiverContext, InputFileMessage, publish_ready_archive, queue_write_order};
use crate::staging::store_written_archive;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use tapeio_archive::{REPAIR_SPOOL_SUFFIX, repair_archive, verify_archive};
use tapeio_cache::ArchiveCache;
use tapeio_common::checksum::digest_reader;
use tapeio_common::{
    ArchiveId, ArchiveLocation, DigestWithSize, Error, ObjectEntry, ObjectLocation, Result,
    TEMP_ARCHIVE_SUFFIX, object_name_of_storage_id,
};
use tracing::{debug, info, warn};

/// Recovery step for one archive file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveRecoveryAction {
    /// Rebuild `{id}` from the readable prefix of `{id}.tmp`, replacing a
    /// stale `{id}` left by an interrupted repair
    RepairTemp {
        archive_id: ArchiveId,
        replace_stale: bool,
    },
    VerifyAndMarkReady(ArchiveId),
    RescheduleWriteOrder(ArchiveId),
    MoveToCache(ArchiveId),
    /// Delete a file by name
    Delete(String),
}

/// Plan the recovery of one partition directory.
///
/// `files` are the regular file names found in the directory, `locations`
/// the recorded location of every archive known to the store and `cached`
/// the archives already present in the disk cache.
pub fn plan_archive_recovery(
    files: &[String],
    locations: &HashMap<ArchiveId, ArchiveLocation>,
    cached: &BTreeSet<ArchiveId>,
) -> Result<Vec<ArchiveRecoveryAction>> {
    let names: BTreeSet<&str> = files.iter().map(String::as_str).collect();
    let mut actions = Vec::new();
    for name in &names {
        if name.ends_with(REPAIR_SPOOL_SUFFIX) {
            actions.push(ArchiveRecoveryAction::Delete((*name).to_string()));
            continue;
        }
        let (archive_id, temporary) = parse_archive_file_name(name)?;
        let location = locations.get(&archive_id).ok_or_else(|| {
            Error::integrity(format!("archive file {name} is not known to the metadata store"))
        })?;
        let action = match (location, temporary) {
            (ArchiveLocation::BuildingOnDisk, true) => ArchiveRecoveryAction::RepairTemp {
                replace_stale: names.contains(archive_id.as_str()),
                archive_id,
            },
            (_, true) => ArchiveRecoveryAction::Delete((*name).to_string()),
            (ArchiveLocation::BuildingOnDisk, false) => {
                if names.contains(archive_id.temp_file_name().as_str()) {
                    // handled by the repair of the temporary file
                    continue;
                }
                ArchiveRecoveryAction::VerifyAndMarkReady(archive_id)
            }
            (ArchiveLocation::ReadyOnDisk, false) => ArchiveRecoveryAction::RescheduleWriteOrder(archive_id),
            (ArchiveLocation::OnTape { .. }, false) if cached.contains(&archive_id) => {
                ArchiveRecoveryAction::Delete((*name).to_string())
            }
            (ArchiveLocation::OnTape { .. }, false) => ArchiveRecoveryAction::MoveToCache(archive_id),
        };
        actions.push(action);
    }
    Ok(actions)
}

fn parse_archive_file_name(name: &str) -> Result<(ArchiveId, bool)> {
    let (id, temporary) = name
        .strip_suffix(TEMP_ARCHIVE_SUFFIX)
        .map_or((name, false), |id| (id, true));
    let archive_id = ArchiveId::parse(id)
        .map_err(|_| Error::integrity(format!("unexpected file {name} in archive directory")))?;
    Ok((archive_id, temporary))
}

/// Recovery step for one input file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputFileAction {
    /// No object uses this file
    DeleteOrphan { storage_id: String },
    /// The object has been archived already
    DeleteRedundant { storage_id: String },
    /// The object still waits for this file; check it and queue it again
    CheckAndReenqueue { storage_id: String, object_name: String },
}

/// Plan the recovery of the input files of one container.
///
/// `objects` maps object names to their current entry.
pub fn plan_input_file_recovery(
    storage_ids: &[String],
    objects: &HashMap<String, ObjectEntry>,
) -> Vec<InputFileAction> {
    storage_ids
        .iter()
        .map(|storage_id| {
            let object = object_name_of_storage_id(storage_id)
                .ok()
                .and_then(|name| objects.get(name))
                .filter(|object| object.storage_id == *storage_id);
            match object {
                None => InputFileAction::DeleteOrphan {
                    storage_id: storage_id.clone(),
                },
                Some(object) => match object.location {
                    ObjectLocation::InTar(_) => InputFileAction::DeleteRedundant {
                        storage_id: storage_id.clone(),
                    },
                    ObjectLocation::InputFile => InputFileAction::CheckAndReenqueue {
                        storage_id: storage_id.clone(),
                        object_name: object.object_name.clone(),
                    },
                },
            }
        })
        .collect()
}

/// Counters of a recovery run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub repaired: usize,
    pub marked_ready: usize,
    pub rescheduled: usize,
    pub moved_to_cache: usize,
    pub deleted: usize,
    pub reenqueued: usize,
}

/// Runs recovery plans against the filesystem and the store
pub struct Bootstrap<'a> {
    ctx: &'a ArchiverContext,
    cache: &'a ArchiveCache,
    verify_batch_size: usize,
}

impl<'a> Bootstrap<'a> {
    pub const fn new(ctx: &'a ArchiverContext, cache: &'a ArchiveCache, verify_batch_size: usize) -> Self {
        Self {
            ctx,
            cache,
            verify_batch_size,
        }
    }

    /// Recover the archive directories of every partition
    pub fn recover_archives(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for partition_id in self.ctx.topology.partitions() {
            self.recover_partition_archives(&partition_id, &mut report)?;
        }
        info!("Archive recovery done: {report:?}");
        Ok(report)
    }

    fn recover_partition_archives(&self, partition_id: &str, report: &mut RecoveryReport) -> Result<()> {
        let dir = self.ctx.partition_dir(partition_id);
        let files = list_regular_files(&dir)?;
        if files.is_empty() {
            return Ok(());
        }

        let ids: Vec<ArchiveId> = files
            .iter()
            .filter_map(|name| parse_archive_file_name(name).ok().map(|(id, _)| id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let locations: HashMap<ArchiveId, ArchiveLocation> = self
            .ctx
            .store
            .bulk_find_archives(&ids)?
            .into_iter()
            .map(|archive| (archive.archive_id, archive.location))
            .collect();
        let cached: BTreeSet<ArchiveId> = ids
            .iter()
            .filter(|id| self.cache.contains(partition_id, id))
            .cloned()
            .collect();

        for action in plan_archive_recovery(&files, &locations, &cached)? {
            debug!("Recovering partition {partition_id}: {action:?}");
            self.execute_archive_action(partition_id, &dir, action, report)?;
        }
        Ok(())
    }

    fn execute_archive_action(
        &self,
        partition_id: &str,
        dir: &Path,
        action: ArchiveRecoveryAction,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        match action {
            ArchiveRecoveryAction::RepairTemp {
                archive_id,
                replace_stale,
            } => {
                let final_path = dir.join(archive_id.as_str());
                if replace_stale {
                    fs::remove_file(&final_path)?;
                }
                let temp_path = dir.join(archive_id.temp_file_name());
                let repaired = repair_archive(
                    &temp_path,
                    &final_path,
                    &archive_id,
                    self.ctx.archive.max_archive_size,
                )?;
                fs::remove_file(&temp_path)?;
                warn!(
                    "Repaired archive {partition_id}/{archive_id}: {} entries kept{}",
                    repaired.entries.len(),
                    if repaired.truncated { ", tail lost" } else { "" }
                );
                report.repaired += 1;
                self.verify_and_publish(partition_id, &final_path, &archive_id)?;
                report.marked_ready += 1;
            }
            ArchiveRecoveryAction::VerifyAndMarkReady(archive_id) => {
                self.verify_and_publish(partition_id, &dir.join(archive_id.as_str()), &archive_id)?;
                report.marked_ready += 1;
            }
            ArchiveRecoveryAction::RescheduleWriteOrder(archive_id) => {
                let archive = self
                    .ctx
                    .store
                    .find_archive(&archive_id)?
                    .ok_or_else(|| Error::referential(format!("archive {archive_id} disappeared")))?;
                let (Some(size), Some(digest)) = (archive.size, archive.digest) else {
                    return Err(Error::integrity(format!(
                        "ready archive {archive_id} has no size or digest"
                    )));
                };
                let queued = queue_write_order(
                    self.ctx.queue.as_ref(),
                    self.ctx.topology.as_ref(),
                    partition_id,
                    &archive_id,
                    &DigestWithSize { size, digest },
                )?;
                if queued {
                    report.rescheduled += 1;
                }
            }
            ArchiveRecoveryAction::MoveToCache(archive_id) => {
                store_written_archive(self.cache, &dir.join(archive_id.as_str()), partition_id, &archive_id)?;
                report.moved_to_cache += 1;
            }
            ArchiveRecoveryAction::Delete(name) => {
                info!("Deleting leftover archive file {partition_id}/{name}");
                remove_if_exists(&dir.join(name))?;
                report.deleted += 1;
            }
        }
        Ok(())
    }

    fn verify_and_publish(&self, partition_id: &str, path: &Path, archive_id: &ArchiveId) -> Result<()> {
        let digest = verify_archive(path, archive_id, &self.ctx.store, self.verify_batch_size)?;
        publish_ready_archive(
            &self.ctx.store,
            self.ctx.queue.as_ref(),
            self.ctx.topology.as_ref(),
            partition_id,
            archive_id,
            &digest,
        )
    }

    /// Recover the input files of every container. Files still waiting
    /// for aggregation are handed to `submit`.
    pub fn recover_input_files<F>(&self, mut submit: F) -> Result<RecoveryReport>
    where
        F: FnMut(InputFileMessage) -> Result<()>,
    {
        let mut report = RecoveryReport::default();
        for partition_id in self.ctx.topology.partitions() {
            for container in self.ctx.topology.containers_of(&partition_id) {
                self.recover_container_input_files(&container, &mut submit, &mut report)?;
            }
        }
        info!("Input file recovery done: {report:?}");
        Ok(report)
    }

    fn recover_container_input_files<F>(
        &self,
        container: &str,
        submit: &mut F,
        report: &mut RecoveryReport,
    ) -> Result<()>
    where
        F: FnMut(InputFileMessage) -> Result<()>,
    {
        let storage_ids = self.ctx.loose.list_ids(container)?;
        if storage_ids.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = storage_ids
            .iter()
            .filter_map(|id| object_name_of_storage_id(id).ok().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let objects: HashMap<String, ObjectEntry> = self
            .ctx
            .store
            .bulk_find_objects(container, &names)?
            .into_iter()
            .map(|object| (object.object_name.clone(), object))
            .collect();

        for action in plan_input_file_recovery(&storage_ids, &objects) {
            match action {
                InputFileAction::DeleteOrphan { storage_id } | InputFileAction::DeleteRedundant { storage_id } => {
                    debug!("Deleting input file {container}/{storage_id}");
                    self.ctx.loose.delete(container, &storage_id)?;
                    report.deleted += 1;
                }
                InputFileAction::CheckAndReenqueue {
                    storage_id,
                    object_name,
                } => {
                    let Some(object) = objects.get(&object_name) else {
                        continue;
                    };
                    if self.input_file_matches(container, &storage_id, object)? {
                        submit(InputFileMessage {
                            container: container.to_string(),
                            object_name,
                            storage_id,
                        })?;
                        report.reenqueued += 1;
                    } else {
                        warn!("Input file {container}/{storage_id} does not match its digest, deleting");
                        self.ctx.loose.delete(container, &storage_id)?;
                        report.deleted += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn input_file_matches(&self, container: &str, storage_id: &str, object: &ObjectEntry) -> Result<bool> {
        let Some(file) = self.ctx.loose.read(container, storage_id)? else {
            return Ok(false);
        };
        let actual = digest_reader(io::BufReader::new(file))?;
        Ok(actual.size == object.size && actual.digest == object.digest)
    }
}

fn list_regular_files(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        } else {
            warn!("Ignoring {} in archive directory", entry.path().display());
        }
    }
    files.sort();
    Ok(files)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
