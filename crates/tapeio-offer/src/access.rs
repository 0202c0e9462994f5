//! Access request lifecycle
//!
//! A request tracks the archives its objects live in that are not on disk
//! yet. While that set is non-empty the request is not ready and a read
//! order is queued for each missing archive. When the last archive arrives
//! the request becomes ready and gets its expiration and purge dates.
//!
//! Records are shared between server instances: every read-modify-write
//! goes through a version-checked update and is retried on conflict.

use crate::retry::{Attempt, RetryPolicy, retry_on_conflict};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tapeio_cache::ArchiveCache;
use tapeio_common::config::AccessRequestConfig;
use tapeio_common::order::read_order_key;
use tapeio_common::{
    AccessRequest, AccessRequestId, AccessRequestStatus, ArchiveEntry, ArchiveId, ArchiveLocation, Error,
    OrderQueue, QueueOrder, ReadOrder, Result, TopologyResolver,
};
use tapeio_meta_store::MetaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Outcome of one maintenance run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Archives found on disk although requests still waited for them
    pub fixed_archives: usize,
    pub purged_requests: usize,
}

/// `now` plus `secs`, saturating at the latest representable date
fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Creates, tracks and removes access requests
pub struct AccessRequestManager {
    store: Arc<MetaStore>,
    cache: Arc<ArchiveCache>,
    queue: Arc<dyn OrderQueue>,
    topology: Arc<dyn TopologyResolver>,
    config: AccessRequestConfig,
    cleanup_batch_size: usize,
    retry: RetryPolicy,
}

impl AccessRequestManager {
    pub fn new(
        store: Arc<MetaStore>,
        cache: Arc<ArchiveCache>,
        queue: Arc<dyn OrderQueue>,
        topology: Arc<dyn TopologyResolver>,
        config: AccessRequestConfig,
        cleanup_batch_size: usize,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            cache,
            queue,
            topology,
            config,
            cleanup_batch_size: cleanup_batch_size.max(1),
            retry,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn mark_ready(&self, request: &mut AccessRequest, now: DateTime<Utc>) {
        request.ready_date = Some(now);
        request.expiration_date = Some(after(now, self.config.expiration_delay_secs));
        request.purge_date = Some(after(now, self.config.purge_delay_secs));
    }

    fn is_visible(&self, request: &AccessRequest, tenant: u32) -> bool {
        request.tenant == tenant
            || (self.config.allow_admin_cross_tenant && tenant == self.config.admin_tenant)
    }

    /// Whether an archive can be read from disk right now
    fn is_on_disk(&self, archive: &ArchiveEntry) -> bool {
        match archive.location {
            ArchiveLocation::BuildingOnDisk | ArchiveLocation::ReadyOnDisk => true,
            ArchiveLocation::OnTape { .. } => self.cache.contains(&archive.partition_id, &archive.archive_id),
        }
    }

    /// Archives holding the named objects. Unknown objects are skipped; an
    /// object pointing at an unknown archive is a referential fault.
    fn archives_of(&self, container: &str, object_names: &[String]) -> Result<Vec<ArchiveEntry>> {
        let mut ids = BTreeSet::new();
        for object in self.store.bulk_find_objects(container, object_names)? {
            ids.extend(object.location.archive_ids());
        }
        let ids: Vec<ArchiveId> = ids.into_iter().collect();
        let archives = self.store.bulk_find_archives(&ids)?;
        if archives.len() != ids.len() {
            let found: HashSet<&ArchiveId> = archives.iter().map(|a| &a.archive_id).collect();
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(ToString::to_string)
                .collect();
            return Err(Error::referential(format!(
                "objects of {container} refer to unknown archives: {}",
                missing.join(", ")
            )));
        }
        Ok(archives)
    }

    fn read_order(&self, archive: &ArchiveEntry) -> Result<QueueOrder> {
        let ArchiveLocation::OnTape {
            tape_code,
            file_position,
        } = &archive.location
        else {
            return Err(Error::illegal_state(format!(
                "archive {} is not on tape",
                archive.archive_id
            )));
        };
        Ok(QueueOrder::Read(ReadOrder {
            tape_code: tape_code.clone(),
            file_position: *file_position,
            archive_id: archive.archive_id.clone(),
            bucket_id: self.topology.bucket_of(&archive.partition_id)?,
            partition_id: archive.partition_id.clone(),
            size: archive.size.unwrap_or_default(),
        }))
    }

    fn queue_read_order(&self, archive: &ArchiveEntry) -> Result<bool> {
        let order = self.read_order(archive)?;
        self.queue
            .add_if_absent(&read_order_key(&archive.archive_id), order)
    }

    /// Create a request for objects of one container
    pub fn create(&self, container: &str, object_names: &[String], tenant: u32) -> Result<AccessRequestId> {
        if object_names.is_empty() {
            return Err(Error::bad_request("access request needs at least one object"));
        }
        if object_names.len() > self.config.max_objects_per_request {
            return Err(Error::bad_request(format!(
                "access request names {} objects, at most {} allowed",
                object_names.len(),
                self.config.max_objects_per_request
            )));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = object_names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(Error::bad_request(format!("duplicate object name {duplicate:?}")));
        }
        self.topology.partition_of(container)?;

        let archives = self.archives_of(container, object_names)?;
        let missing: Vec<&ArchiveEntry> = archives.iter().filter(|a| !self.is_on_disk(a)).collect();

        let now = Utc::now();
        let mut request = AccessRequest {
            request_id: AccessRequestId::generate(),
            container: container.to_string(),
            object_names: object_names.to_vec(),
            creation_date: now,
            ready_date: None,
            expiration_date: None,
            purge_date: None,
            unavailable_archive_ids: missing.iter().map(|a| a.archive_id.clone()).collect(),
            tenant,
            version: 0,
        };
        if missing.is_empty() {
            self.mark_ready(&mut request, now);
        }
        self.store.insert_access_request(&request)?;

        for archive in &missing {
            if self.queue_read_order(archive)? {
                debug!("Queued read order for archive {}", archive.archive_id);
            }
        }
        info!(
            "Created access request {} for {} objects of {container}, {} archives to fetch",
            request.request_id,
            object_names.len(),
            missing.len()
        );
        Ok(request.request_id)
    }

    /// Status of each request, in the order asked
    pub fn check_statuses(
        &self,
        request_ids: &[AccessRequestId],
        tenant: u32,
    ) -> Result<Vec<(AccessRequestId, AccessRequestStatus)>> {
        if request_ids.is_empty() {
            return Err(Error::bad_request("no access request id given"));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = request_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(Error::bad_request(format!("duplicate access request id {duplicate}")));
        }

        let now = Utc::now();
        let found: BTreeMap<AccessRequestId, AccessRequest> = self
            .store
            .bulk_find_access_requests(request_ids)?
            .into_iter()
            .map(|r| (r.request_id.clone(), r))
            .collect();
        Ok(request_ids
            .iter()
            .map(|id| {
                let status = match found.get(id) {
                    Some(request) if self.is_visible(request, tenant) => {
                        if !request.is_ready() {
                            AccessRequestStatus::NotReady
                        } else if request.is_expired_at(now) {
                            AccessRequestStatus::Expired
                        } else {
                            AccessRequestStatus::Ready
                        }
                    }
                    _ => AccessRequestStatus::NotFound,
                };
                (id.clone(), status)
            })
            .collect())
    }

    /// Delete a request. Unknown or foreign requests are ignored.
    ///
    /// Read orders no longer needed by any request are cancelled if not
    /// started. A request created concurrently for the same archive gets
    /// its read order back.
    pub fn remove(&self, request_id: &AccessRequestId, tenant: u32) -> Result<()> {
        let Some(request) = self.store.find_access_request(request_id)? else {
            return Ok(());
        };
        if !self.is_visible(&request, tenant) {
            debug!("Access request {request_id} belongs to another tenant, not removing");
            return Ok(());
        }
        if !self.store.delete_access_request(request_id)? {
            return Ok(());
        }
        info!("Removed access request {request_id}");

        let unneeded = self
            .store
            .exclude_archive_ids_still_required(&request.unavailable_archive_ids)?;
        for archive_id in unneeded {
            if !self.queue.cancel_if_not_started(&read_order_key(&archive_id))? {
                continue;
            }
            debug!("Cancelled read order of archive {archive_id}");
            // someone may have asked for it between the check and the cancel
            if self
                .store
                .find_access_requests_by_unavailable_archive(&archive_id)?
                .is_empty()
            {
                continue;
            }
            if let Some(archive) = self.store.find_archive(&archive_id)? {
                warn!("Archive {archive_id} requested again while cancelling, queueing it back");
                self.queue_read_order(&archive)?;
            }
        }
        Ok(())
    }

    /// Whether every archive holding the named objects is on disk
    pub fn check_object_availability(&self, container: &str, object_names: &[String]) -> Result<bool> {
        Ok(self
            .archives_of(container, object_names)?
            .iter()
            .all(|archive| self.is_on_disk(archive)))
    }

    /// An archive reached the disk: update every request waiting for it
    pub fn on_archive_ready(&self, archive_id: &ArchiveId) -> Result<()> {
        let waiting = self
            .store
            .find_access_requests_by_unavailable_archive(archive_id)?;
        for request in waiting {
            self.remove_unavailable_archive(&request.request_id, archive_id)?;
        }
        Ok(())
    }

    fn remove_unavailable_archive(&self, request_id: &AccessRequestId, archive_id: &ArchiveId) -> Result<()> {
        retry_on_conflict(&self.retry, "access request update", || {
            match self.store.find_access_request(request_id)? {
                Some(current) => self.try_remove_unavailable_archive(&current, archive_id),
                None => Ok(Attempt::Done(())),
            }
        })
    }

    /// One optimistic update of the `current` snapshot of a request
    fn try_remove_unavailable_archive(&self, current: &AccessRequest, archive_id: &ArchiveId) -> Result<Attempt<()>> {
        if !current.unavailable_archive_ids.contains(archive_id) {
            return Ok(Attempt::Done(()));
        }
        let mut updated = current.clone();
        updated.unavailable_archive_ids.remove(archive_id);
        if updated.unavailable_archive_ids.is_empty() {
            self.mark_ready(&mut updated, Utc::now());
        }
        updated.version = current.version + 1;
        if !self
            .store
            .update_access_request_if_version(&updated, current.version)?
        {
            return Ok(Attempt::Conflict);
        }
        if updated.is_ready() {
            info!("Access request {} is ready", current.request_id);
        }
        Ok(Attempt::Done(()))
    }

    /// One maintenance run: catch up on missed archive notifications, then
    /// purge requests past their purge date.
    pub fn run_cleanup_once(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let awaited: BTreeSet<ArchiveId> = self
            .store
            .find_non_ready_access_requests()?
            .into_iter()
            .flat_map(|r| r.unavailable_archive_ids)
            .collect();
        let awaited: Vec<ArchiveId> = awaited.into_iter().collect();
        for archive in self.store.bulk_find_archives(&awaited)? {
            if self.is_on_disk(&archive) {
                debug!("Archive {} is on disk but requests still wait for it", archive.archive_id);
                self.on_archive_ready(&archive.archive_id)?;
                report.fixed_archives += 1;
            }
        }

        loop {
            let purged = self
                .store
                .cleanup_expired_access_requests(now, self.cleanup_batch_size)?;
            report.purged_requests += purged.len();
            if purged.len() < self.cleanup_batch_size {
                break;
            }
        }

        if report != CleanupReport::default() {
            info!(
                "Access request maintenance: {} archives fixed, {} requests purged",
                report.fixed_archives, report.purged_requests
            );
        }
        Ok(report)
    }

    /// Spawn the periodic maintenance task
    pub fn start_cleanup(self: &Arc<Self>) -> CleanupTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.config.cleanup_interval();
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let run = Arc::clone(&manager);
                    match tokio::task::spawn_blocking(move || run.run_cleanup_once(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Access request maintenance failed: {e}"),
                        Err(e) => error!("Access request maintenance panicked: {e}"),
                    }
                }
                info!("Access request maintenance stopped");
            }
            .instrument(info_span!("access-request-cleanup")),
        );
        CleanupTask {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Owned handle on the maintenance task
pub struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stop the task and wait for the run in progress, if any
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Access request maintenance terminated abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use parking_lot::Mutex;
    use std::thread;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn status(fx: &Fixture, id: &AccessRequestId, tenant: u32) -> AccessRequestStatus {
        fx.access.check_statuses(std::slice::from_ref(id), tenant).unwrap()[0].1
    }

    fn read_orders(fx: &Fixture) -> Vec<ArchiveId> {
        fx.store
            .list_orders()
            .unwrap()
            .into_iter()
            .filter_map(|o| match o.order {
                QueueOrder::Read(r) => Some(r.archive_id),
                QueueOrder::Write(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_input_validation() {
        let fx = Fixture::new();
        let err = fx.access.create("c", &[], 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = fx.access.create("c", &names(&["o1", "o1"]), 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let too_many: Vec<String> = (0..=fx.config.access_request.max_objects_per_request)
            .map(|i| format!("o{i}"))
            .collect();
        assert!(matches!(fx.access.create("c", &too_many, 1).unwrap_err(), Error::BadRequest(_)));
        assert!(matches!(fx.access.create("nope", &names(&["o1"]), 1).unwrap_err(), Error::BadRequest(_)));

        let id = AccessRequestId::generate();
        let err = fx.access.check_statuses(&[id.clone(), id], 1).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_objects_on_disk_make_ready_request() {
        let fx = Fixture::new();
        fx.put_input_object("c", "loose", b"abc");
        fx.put_archived_object("c", "archived", ArchiveLocation::ReadyOnDisk);
        assert!(fx.access.check_object_availability("c", &names(&["loose", "archived"])).unwrap());

        let id = fx.access.create("c", &names(&["loose", "archived", "unknown"]), 1).unwrap();
        assert_eq!(status(&fx, &id, 1), AccessRequestStatus::Ready);
        let request = fx.store.find_access_request(&id).unwrap().unwrap();
        assert!(request.expiration_date.is_some() && request.purge_date.is_some());
        assert!(read_orders(&fx).is_empty());
    }

    #[test]
    fn test_unknown_archive_is_referential_fault() {
        let fx = Fixture::new();
        fx.put_object_in("c", "o1", &ArchiveId::generate());
        let err = fx.access.create("c", &names(&["o1"]), 1).unwrap_err();
        assert!(matches!(err, Error::Referential(_)));
    }

    #[test]
    fn test_convergence_in_any_order() {
        for reversed in [false, true] {
            let fx = Fixture::new();
            let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
            let b = fx.put_archived_object("c", "o2", Fixture::on_tape(2));
            assert!(!fx.access.check_object_availability("c", &names(&["o1", "o2"])).unwrap());

            let id = fx.access.create("c", &names(&["o1", "o2"]), 1).unwrap();
            let request = fx.store.find_access_request(&id).unwrap().unwrap();
            assert_eq!(request.unavailable_archive_ids, BTreeSet::from([a.clone(), b.clone()]));
            assert_eq!(read_orders(&fx).len(), 2);

            let (first, second) = if reversed { (&b, &a) } else { (&a, &b) };
            fx.stage_into_cache(first);
            fx.access.on_archive_ready(first).unwrap();
            assert_eq!(status(&fx, &id, 1), AccessRequestStatus::NotReady);
            // repeated notification changes nothing
            fx.access.on_archive_ready(first).unwrap();
            fx.stage_into_cache(second);
            fx.access.on_archive_ready(second).unwrap();

            let request = fx.store.find_access_request(&id).unwrap().unwrap();
            assert!(request.unavailable_archive_ids.is_empty());
            assert!(request.ready_date.is_some());
            assert_eq!(status(&fx, &id, 1), AccessRequestStatus::Ready);
        }
    }

    #[test]
    fn test_read_orders_are_deduplicated() {
        let fx = Fixture::new();
        let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        fx.access.create("c", &names(&["o1"]), 1).unwrap();
        fx.access.create("c", &names(&["o1"]), 2).unwrap();
        assert_eq!(read_orders(&fx), vec![a]);
    }

    #[test]
    fn test_tenant_isolation() {
        let mut fx = Fixture::new();
        fx.put_archived_object("c", "o1", ArchiveLocation::ReadyOnDisk);
        let id = fx.access.create("c", &names(&["o1"]), 1).unwrap();

        assert_eq!(status(&fx, &id, 2), AccessRequestStatus::NotFound);
        // admin tenant without the bypass sees nothing either
        let admin = fx.config.access_request.admin_tenant;
        assert_eq!(status(&fx, &id, admin), AccessRequestStatus::NotFound);

        // removing from another tenant is a silent no-op
        fx.access.remove(&id, 2).unwrap();
        assert!(fx.store.find_access_request(&id).unwrap().is_some());

        fx.config.access_request.allow_admin_cross_tenant = true;
        fx.rebuild_access_manager();
        assert_eq!(status(&fx, &id, admin), AccessRequestStatus::Ready);
        assert_eq!(status(&fx, &id, 2), AccessRequestStatus::NotFound);
    }

    #[test]
    fn test_remove_cancels_unneeded_read_orders() {
        let fx = Fixture::new();
        let shared = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        fx.put_archived_object("c", "o2", Fixture::on_tape(2));
        let first = fx.access.create("c", &names(&["o1", "o2"]), 1).unwrap();
        let _second = fx.access.create("c", &names(&["o1"]), 1).unwrap();
        assert_eq!(read_orders(&fx).len(), 2);

        fx.access.remove(&first, 1).unwrap();
        assert_eq!(read_orders(&fx), vec![shared]);
        assert!(fx.store.find_access_request(&first).unwrap().is_none());
        // idempotent
        fx.access.remove(&first, 1).unwrap();
    }

    #[test]
    fn test_request_deleted_during_update_is_ignored() {
        let fx = Fixture::new();
        let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        let id = fx.access.create("c", &names(&["o1"]), 1).unwrap();
        fx.store.delete_access_request(&id).unwrap();
        fx.access.remove_unavailable_archive(&id, &a).unwrap();
        assert!(fx.store.find_access_request(&id).unwrap().is_none());
    }

    #[test]
    fn test_expiration() {
        let fx = Fixture::new();
        fx.put_archived_object("c", "o1", ArchiveLocation::ReadyOnDisk);
        let id = fx.access.create("c", &names(&["o1"]), 1).unwrap();
        let mut request = fx.store.find_access_request(&id).unwrap().unwrap();
        request.expiration_date = Some(Utc::now() - Duration::seconds(1));
        request.version += 1;
        fx.store
            .update_access_request_if_version(&request, request.version - 1)
            .unwrap();
        assert_eq!(status(&fx, &id, 1), AccessRequestStatus::Expired);
    }

    #[test]
    fn test_cleanup_fixes_missed_notifications_and_purges() {
        let fx = Fixture::new();
        let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        let waiting = fx.access.create("c", &names(&["o1"]), 1).unwrap();
        fx.put_archived_object("c", "o2", ArchiveLocation::ReadyOnDisk);
        let ready = fx.access.create("c", &names(&["o2"]), 1).unwrap();

        // the archive arrived but nobody told the manager
        fx.stage_into_cache(&a);
        let report = fx.access.run_cleanup_once(Utc::now()).unwrap();
        assert_eq!(report.fixed_archives, 1);
        assert_eq!(report.purged_requests, 0);
        assert_eq!(status(&fx, &waiting, 1), AccessRequestStatus::Ready);

        let far_future = Utc::now() + Duration::days(365);
        let report = fx.access.run_cleanup_once(far_future).unwrap();
        assert_eq!(report.purged_requests, 2);
        assert_eq!(status(&fx, &ready, 1), AccessRequestStatus::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_task_lifecycle() {
        let fx = Fixture::new();
        let task = fx.access.start_cleanup();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.shutdown().await;
    }

    #[test]
    fn test_stale_update_conflicts_then_converges() {
        let fx = Fixture::new();
        let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        let b = fx.put_archived_object("c", "o2", Fixture::on_tape(2));
        let id = fx.access.create("c", &names(&["o1", "o2"]), 1).unwrap();
        let snapshot = fx.store.find_access_request(&id).unwrap().unwrap();

        // another instance handles the arrival of b after the snapshot was read
        fx.stage_into_cache(&b);
        fx.access.on_archive_ready(&b).unwrap();

        let attempt = fx.access.try_remove_unavailable_archive(&snapshot, &a).unwrap();
        assert!(matches!(attempt, Attempt::Conflict));
        let request = fx.store.find_access_request(&id).unwrap().unwrap();
        assert_eq!(request.unavailable_archive_ids, BTreeSet::from([a.clone()]));

        // the retry loop reads again and succeeds
        fx.stage_into_cache(&a);
        fx.access.on_archive_ready(&a).unwrap();
        let request = fx.store.find_access_request(&id).unwrap().unwrap();
        assert!(request.unavailable_archive_ids.is_empty());
        assert!(request.is_ready());
        assert_eq!(request.version, snapshot.version + 2);
    }

    #[test]
    fn test_concurrent_arrivals_converge() {
        let fx = Fixture::new();
        let objects: Vec<String> = (0..6).map(|i| format!("o{i}")).collect();
        let archives: Vec<ArchiveId> = objects
            .iter()
            .zip(1..)
            .map(|(name, position)| fx.put_archived_object("c", name, Fixture::on_tape(position)))
            .collect();
        let manager = Arc::new(
            AccessRequestManager::new(
                Arc::clone(&fx.store),
                Arc::clone(&fx.cache),
                Arc::clone(&fx.store) as Arc<dyn OrderQueue>,
                Arc::clone(&fx.topology),
                fx.config.access_request.clone(),
                2,
            )
            .with_retry_policy(RetryPolicy::immediate(50)),
        );
        let id = manager.create("c", &objects, 1).unwrap();
        for archive_id in &archives {
            fx.stage_into_cache(archive_id);
        }

        let handles: Vec<_> = archives
            .iter()
            .cloned()
            .map(|archive_id| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.on_archive_ready(&archive_id))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let request = fx.store.find_access_request(&id).unwrap().unwrap();
        assert!(request.unavailable_archive_ids.is_empty());
        assert!(request.is_ready());
        assert_eq!(request.version, 6);
    }

    /// Order queue letting another request in right before a cancellation
    struct RacingQueue {
        store: Arc<MetaStore>,
        before_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl OrderQueue for RacingQueue {
        fn enqueue(&self, order: QueueOrder) -> Result<()> {
            self.store.enqueue(order)
        }

        fn add_if_absent(&self, dedup_key: &str, order: QueueOrder) -> Result<bool> {
            self.store.add_if_absent(dedup_key, order)
        }

        fn cancel_if_not_started(&self, dedup_key: &str) -> Result<bool> {
            if let Some(hook) = self.before_cancel.lock().take() {
                hook();
            }
            self.store.cancel_if_not_started(dedup_key)
        }
    }

    #[test]
    fn test_remove_requeues_archive_requested_meanwhile() {
        let fx = Fixture::new();
        let a = fx.put_archived_object("c", "o1", Fixture::on_tape(1));
        let other = Arc::clone(&fx.access);
        let late_request = Arc::new(Mutex::new(None));
        let late = Arc::clone(&late_request);
        let queue = Arc::new(RacingQueue {
            store: Arc::clone(&fx.store),
            before_cancel: Mutex::new(Some(Box::new(move || {
                // the read order still exists, so this one is deduplicated away
                *late.lock() = Some(other.create("c", &names(&["o1"]), 2).unwrap());
            }))),
        });
        let manager = AccessRequestManager::new(
            Arc::clone(&fx.store),
            Arc::clone(&fx.cache),
            queue,
            Arc::clone(&fx.topology),
            fx.config.access_request.clone(),
            2,
        );

        let id = manager.create("c", &names(&["o1"]), 1).unwrap();
        assert_eq!(read_orders(&fx), vec![a.clone()]);
        manager.remove(&id, 1).unwrap();

        assert!(fx.store.find_access_request(&id).unwrap().is_none());
        let late = late_request.lock().clone().unwrap();
        assert_eq!(status(&fx, &late, 2), AccessRequestStatus::NotReady);
        assert_eq!(read_orders(&fx), vec![a]);
    }
}
