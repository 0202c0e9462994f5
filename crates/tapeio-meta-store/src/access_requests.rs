//! Access request records
//!
//! Requests are rewritten with optimistic concurrency: a writer reads a
//! record, bumps `version` on its copy and commits only if the stored
//! version is still the one it read.

use crate::store::{MetaStore, MetaStoreResult};
use crate::tables;
use chrono::{DateTime, Utc};
use redb::ReadableTable;
use std::collections::BTreeSet;
use tapeio_common::{AccessRequest, AccessRequestId, ArchiveId};

impl MetaStore {
    /// Insert a new request. Fails if the id already exists.
    pub fn insert_access_request(&self, request: &AccessRequest) -> MetaStoreResult<()> {
        self.insert_new_bincode(
            tables::ACCESS_REQUESTS,
            "access_requests",
            request.request_id.as_str(),
            request,
        )
    }

    pub fn find_access_request(
        &self,
        request_id: &AccessRequestId,
    ) -> MetaStoreResult<Option<AccessRequest>> {
        self.get_bincode(tables::ACCESS_REQUESTS, request_id.as_str())
    }

    /// Look up many requests. Unknown ids are skipped.
    pub fn bulk_find_access_requests(
        &self,
        request_ids: &[AccessRequestId],
    ) -> MetaStoreResult<Vec<AccessRequest>> {
        let keys: Vec<String> = request_ids.iter().map(|id| id.as_str().to_string()).collect();
        self.bulk_get_bincode(tables::ACCESS_REQUESTS, &keys)
    }

    /// Replace a request if its stored version is still `expected_version`.
    ///
    /// Returns `false` on a version mismatch or if the request was deleted.
    /// The caller re-reads and retries.
    pub fn update_access_request_if_version(
        &self,
        request: &AccessRequest,
        expected_version: u64,
    ) -> MetaStoreResult<bool> {
        self.update_bincode::<AccessRequest, _>(
            tables::ACCESS_REQUESTS,
            request.request_id.as_str(),
            |current| {
                if current.version != expected_version {
                    return false;
                }
                *current = request.clone();
                true
            },
        )
    }

    /// Delete a request. Returns `true` if it existed.
    pub fn delete_access_request(&self, request_id: &AccessRequestId) -> MetaStoreResult<bool> {
        self.delete_key(tables::ACCESS_REQUESTS, request_id.as_str())
    }

    /// Requests still waiting for at least one archive
    pub fn find_non_ready_access_requests(&self) -> MetaStoreResult<Vec<AccessRequest>> {
        self.scan_bincode(tables::ACCESS_REQUESTS, "", |r: &AccessRequest| {
            !r.is_ready()
        })
    }

    /// Requests listing `archive_id` among their unavailable archives
    pub fn find_access_requests_by_unavailable_archive(
        &self,
        archive_id: &ArchiveId,
    ) -> MetaStoreResult<Vec<AccessRequest>> {
        self.scan_bincode(tables::ACCESS_REQUESTS, "", |r: &AccessRequest| {
            r.unavailable_archive_ids.contains(archive_id)
        })
    }

    /// `(container, objectName)` of every object named by a request that
    /// has not expired yet
    pub fn list_distinct_object_ids_for_active_requests(
        &self,
        now: DateTime<Utc>,
    ) -> MetaStoreResult<BTreeSet<(String, String)>> {
        let active = self.scan_bincode(tables::ACCESS_REQUESTS, "", |r: &AccessRequest| {
            !r.is_expired_at(now)
        })?;
        let mut ids = BTreeSet::new();
        for request in active {
            for name in request.object_names {
                ids.insert((request.container.clone(), name));
            }
        }
        Ok(ids)
    }

    /// Keep only the archive ids no request is waiting for anymore
    pub fn exclude_archive_ids_still_required(
        &self,
        archive_ids: &BTreeSet<ArchiveId>,
    ) -> MetaStoreResult<BTreeSet<ArchiveId>> {
        let mut remaining = archive_ids.clone();
        if remaining.is_empty() {
            return Ok(remaining);
        }
        let waiting = self.scan_bincode(tables::ACCESS_REQUESTS, "", |r: &AccessRequest| {
            !r.unavailable_archive_ids.is_disjoint(archive_ids)
        })?;
        for request in waiting {
            for id in &request.unavailable_archive_ids {
                remaining.remove(id);
            }
        }
        Ok(remaining)
    }

    /// Delete up to `batch_size` requests whose purge date has passed and
    /// return them.
    pub fn cleanup_expired_access_requests(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> MetaStoreResult<Vec<AccessRequest>> {
        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut table = write_txn.open_table(tables::ACCESS_REQUESTS)?;
            let mut expired: Vec<AccessRequest> = Vec::new();
            for entry in table.iter()? {
                let (_, bytes) = entry?;
                let request: AccessRequest = bincode::deserialize(bytes.value())?;
                if request.purge_date.is_some_and(|d| d < now) {
                    expired.push(request);
                    if expired.len() >= batch_size {
                        break;
                    }
                }
            }
            for request in &expired {
                table.remove(request.request_id.as_str())?;
            }
            expired
        };
        write_txn.commit()?;
        Ok(purged)
    }
}
