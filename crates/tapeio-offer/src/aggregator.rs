//! Aggregation of loose objects into archives
//!
//! Every partition has exactly one worker, which owns the archive being
//! built for that partition; no lock protects the writer or its offsets.
//! For each object the worker:
//! 1. opens the loose file (a missing file means the message was handled);
//! 2. appends it as one or more entries, rolling to a new archive whenever
//!    the next entry does not fit;
//! 3. checks the digest computed while reading against the recorded one;
//! 4. points the object at its entries, then deletes the loose file.
//!
//! An archive that stays open longer than the buffering timeout is sealed
//! even if not full. A failure of the archive writer stops the worker: the
//! half-written archive is left for the startup repair.

use crate::loose::LooseObjectStore;
use crate::retry::{RetryPolicy, retry_transient};
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tapeio_archive::ArchiveWriter;
use tapeio_common::checksum::HashingReader;
use tapeio_common::config::ArchiveConfig;
use tapeio_common::order::write_order_key;
use tapeio_common::{
    ArchiveEntry, ArchiveId, DigestWithSize, EntryName, Error, ObjectLocation, OrderQueue, QueueOrder,
    Result, TopologyResolver, WriteOrder,
};
use tapeio_meta_store::MetaStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// A loose object waiting to be archived
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFileMessage {
    pub container: String,
    pub object_name: String,
    pub storage_id: String,
}

/// Collaborators shared by all aggregation workers
pub struct ArchiverContext {
    pub store: Arc<MetaStore>,
    pub loose: Arc<dyn LooseObjectStore>,
    pub queue: Arc<dyn OrderQueue>,
    pub topology: Arc<dyn TopologyResolver>,
    pub input_tars_dir: PathBuf,
    pub archive: ArchiveConfig,
    pub retry: RetryPolicy,
}

impl ArchiverContext {
    pub(crate) fn partition_dir(&self, partition_id: &str) -> PathBuf {
        self.input_tars_dir.join(partition_id)
    }
}

/// Sizes of the entries an object of `size` bytes is split into
pub(crate) fn entry_sizes(size: u64, max_entry_size: u64) -> Vec<u64> {
    if size == 0 {
        return vec![0];
    }
    let mut sizes = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(max_entry_size);
        sizes.push(chunk);
        remaining -= chunk;
    }
    sizes
}

/// Record a sealed archive as ready and ask for it to be written to tape
pub(crate) fn publish_ready_archive(
    store: &MetaStore,
    queue: &dyn OrderQueue,
    topology: &dyn TopologyResolver,
    partition_id: &str,
    archive_id: &ArchiveId,
    digest: &DigestWithSize,
) -> Result<()> {
    if !store.mark_archive_ready(archive_id, digest.size, &digest.digest)? {
        warn!("Archive {archive_id} was no longer building when sealed");
    }
    queue_write_order(queue, topology, partition_id, archive_id, digest)?;
    Ok(())
}

/// Enqueue the write order of an archive unless one is already queued
pub(crate) fn queue_write_order(
    queue: &dyn OrderQueue,
    topology: &dyn TopologyResolver,
    partition_id: &str,
    archive_id: &ArchiveId,
    digest: &DigestWithSize,
) -> Result<bool> {
    let order = WriteOrder {
        bucket_id: topology.bucket_of(partition_id)?,
        partition_id: partition_id.to_string(),
        relative_path: format!("{partition_id}/{archive_id}"),
        size: digest.size,
        digest: digest.digest.clone(),
        archive_id: archive_id.clone(),
    };
    queue.add_if_absent(&write_order_key(archive_id), QueueOrder::Write(order))
}

struct OpenArchive {
    writer: ArchiveWriter,
    opened_at: Instant,
}

/// Sequential archive builder of one partition
pub struct PartitionArchiver {
    ctx: Arc<ArchiverContext>,
    partition_id: String,
    current: Option<OpenArchive>,
    failed: bool,
}

impl PartitionArchiver {
    pub fn new(ctx: Arc<ArchiverContext>, partition_id: impl Into<String>) -> Self {
        Self {
            ctx,
            partition_id: partition_id.into(),
            current: None,
            failed: false,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Whether the archive writer failed; the worker must stop
    pub const fn has_failed(&self) -> bool {
        self.failed
    }

    /// Archive currently open, if any
    pub fn current_archive(&self) -> Option<&ArchiveId> {
        self.current.as_ref().map(|open| open.writer.archive_id())
    }

    /// When the open archive must be sealed
    pub fn deadline(&self) -> Option<Instant> {
        let timeout = self.ctx.archive.buffering_timeout();
        self.current.as_ref().map(|open| open.opened_at + timeout)
    }

    /// Archive one loose object
    pub fn process(&mut self, msg: &InputFileMessage) -> Result<()> {
        if self.failed {
            return Err(Error::illegal_state(format!(
                "aggregation of partition {} has failed",
                self.partition_id
            )));
        }
        let ctx = Arc::clone(&self.ctx);

        let Some(object) = ctx.store.find_object(&msg.container, &msg.object_name)? else {
            debug!("Object {}/{} is gone, dropping its input file", msg.container, msg.object_name);
            self.discard_input_file(msg);
            return Ok(());
        };
        if object.storage_id != msg.storage_id {
            debug!("Object {}/{} was overwritten, dropping {}", msg.container, msg.object_name, msg.storage_id);
            self.discard_input_file(msg);
            return Ok(());
        }
        if let ObjectLocation::InTar(_) = object.location {
            debug!("Object {}/{} is already archived", msg.container, msg.object_name);
            self.discard_input_file(msg);
            return Ok(());
        }
        let Some(file) = ctx.loose.read(&msg.container, &msg.storage_id)? else {
            debug!("Input file {}/{} already processed", msg.container, msg.storage_id);
            return Ok(());
        };

        let mut source = HashingReader::new(BufReader::new(file));
        let mut entries = Vec::new();
        for (index, size) in entry_sizes(object.size, ctx.archive.max_entry_size)
            .into_iter()
            .enumerate()
        {
            let index = u32::try_from(index)
                .map_err(|_| Error::bad_request(format!("object {} has too many entries", msg.object_name)))?;
            let entry_name = EntryName::new(&msg.container, &msg.storage_id, index).to_string();
            let writer = self.writer_for(size)?;
            match writer.append(&entry_name, &mut source, size) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        if let Some(open) = self.current.as_mut() {
            if let Err(e) = open.writer.flush() {
                self.failed = true;
                return Err(e);
            }
        }

        let actual = source.finalize();
        if actual.size != object.size || actual.digest != object.digest {
            self.failed = true;
            return Err(Error::integrity(format!(
                "object {}/{} read back with digest {} ({} bytes), expected {} ({} bytes)",
                msg.container, msg.object_name, actual.digest, actual.size, object.digest, object.size
            )));
        }

        let entry_count = entries.len();
        let location = ObjectLocation::InTar(entries);
        let indexed = retry_transient(&ctx.retry, "object location update", || {
            Ok(ctx.store.update_object_location(
                &msg.container,
                &msg.object_name,
                &msg.storage_id,
                location.clone(),
            )?)
        })?;
        if !indexed {
            debug!("Object {}/{} changed while being archived", msg.container, msg.object_name);
        }
        self.discard_input_file(msg);
        debug!(
            "Archived {}/{} in {entry_count} entries ({} bytes)",
            msg.container, msg.object_name, object.size
        );
        Ok(())
    }

    fn discard_input_file(&self, msg: &InputFileMessage) {
        if let Err(e) = self.ctx.loose.delete(&msg.container, &msg.storage_id) {
            warn!("Failed to delete input file {}/{}: {e}", msg.container, msg.storage_id);
        }
    }

    /// Writer with room for an entry of `size` bytes, rolling if needed
    fn writer_for(&mut self, size: u64) -> Result<&mut ArchiveWriter> {
        let fits = self
            .current
            .as_ref()
            .is_some_and(|open| open.writer.can_append(size));
        if !fits {
            self.seal_current()?;
            if let Err(e) = self.open_archive() {
                self.failed = true;
                return Err(e);
            }
        }
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::illegal_state("no archive open"))?;
        if !open.writer.can_append(size) {
            return Err(Error::illegal_state(format!(
                "entry of {size} bytes does not fit in an empty archive"
            )));
        }
        Ok(&mut open.writer)
    }

    fn open_archive(&mut self) -> Result<()> {
        let archive_id = ArchiveId::generate();
        // the record goes first so a crash leaves a discoverable stub
        self.ctx
            .store
            .insert_archive(&ArchiveEntry::building(archive_id.clone(), &self.partition_id))?;
        let path = self
            .ctx
            .partition_dir(&self.partition_id)
            .join(archive_id.temp_file_name());
        let writer = ArchiveWriter::create(path, archive_id.clone(), self.ctx.archive.max_archive_size)?;
        info!("Opened archive {}/{archive_id}", self.partition_id);
        self.current = Some(OpenArchive {
            writer,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    /// Seal the open archive, if any: footer, rename, ready record and
    /// write order.
    pub fn seal_current(&mut self) -> Result<Option<ArchiveId>> {
        let Some(open) = self.current.take() else {
            return Ok(None);
        };
        match self.seal(open.writer) {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn seal(&self, writer: ArchiveWriter) -> Result<ArchiveId> {
        let archive_id = writer.archive_id().clone();
        let temp_path = writer.path().to_path_buf();
        let entry_count = writer.entry_count();
        let digest = writer.finish()?;
        fs::rename(&temp_path, self.ctx.partition_dir(&self.partition_id).join(archive_id.as_str()))?;
        publish_ready_archive(
            &self.ctx.store,
            self.ctx.queue.as_ref(),
            self.ctx.topology.as_ref(),
            &self.partition_id,
            &archive_id,
            &digest,
        )?;
        info!(
            "Sealed archive {}/{archive_id}: {entry_count} entries, {} bytes",
            self.partition_id, digest.size
        );
        Ok(archive_id)
    }
}

/// Routes input files to the worker of their partition
#[derive(Clone)]
pub struct AggregatorClient {
    topology: Arc<dyn TopologyResolver>,
    senders: Arc<HashMap<String, mpsc::UnboundedSender<InputFileMessage>>>,
}

impl AggregatorClient {
    pub fn submit(&self, msg: InputFileMessage) -> Result<()> {
        let partition_id = self.topology.partition_of(&msg.container)?;
        let sender = self
            .senders
            .get(&partition_id)
            .ok_or_else(|| Error::illegal_state(format!("no aggregation worker for partition {partition_id}")))?;
        sender.send(msg).map_err(|_| {
            Error::illegal_state(format!("aggregation worker of partition {partition_id} has stopped"))
        })
    }
}

#[cfg(test)]
impl AggregatorClient {
    /// A client whose messages are collected instead of processed
    pub(crate) fn detached(
        topology: Arc<dyn TopologyResolver>,
    ) -> (Self, mpsc::UnboundedReceiver<InputFileMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let senders = topology.partitions().into_iter().map(|p| (p, tx.clone())).collect();
        let client = Self {
            topology,
            senders: Arc::new(senders),
        };
        (client, rx)
    }
}

/// Owned set of aggregation workers, one per partition
pub struct Aggregator {
    client: AggregatorClient,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Aggregator {
    /// Spawn one worker per partition of the topology
    pub fn start(ctx: Arc<ArchiverContext>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for partition_id in ctx.topology.partitions() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(partition_id.clone(), tx);
            let archiver = PartitionArchiver::new(Arc::clone(&ctx), partition_id.clone());
            let span = info_span!("archive-aggregation", partition = %partition_id);
            workers.push(tokio::spawn(
                run_worker(archiver, rx, shutdown_rx.clone()).instrument(span),
            ));
        }
        info!("Started {} aggregation workers", workers.len());
        Self {
            client: AggregatorClient {
                topology: Arc::clone(&ctx.topology),
                senders: Arc::new(senders),
            },
            shutdown,
            workers,
        }
    }

    pub fn client(&self) -> AggregatorClient {
        self.client.clone()
    }

    /// Stop the workers, sealing the archives they hold open
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Aggregation worker terminated abnormally: {e}");
            }
        }
    }
}

enum Step {
    Process(InputFileMessage),
    Seal,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run one step on the blocking pool, handing the archiver back
async fn run_step(mut archiver: PartitionArchiver, step: Step) -> Option<PartitionArchiver> {
    let outcome = tokio::task::spawn_blocking(move || {
        let result = match step {
            Step::Process(msg) => archiver.process(&msg),
            Step::Seal => archiver.seal_current().map(|_| ()),
        };
        (archiver, result)
    })
    .await;
    match outcome {
        Ok((archiver, Ok(()))) => Some(archiver),
        Ok((archiver, Err(e))) => {
            error!("Aggregation of partition {} failed: {e}", archiver.partition_id());
            Some(archiver)
        }
        Err(e) => {
            error!("Aggregation step panicked: {e}");
            None
        }
    }
}

async fn run_worker(
    mut archiver: PartitionArchiver,
    mut rx: mpsc::UnboundedReceiver<InputFileMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let step = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => Step::Process(msg),
                None => break,
            },
            () = sleep_until(archiver.deadline()) => Step::Seal,
            _ = shutdown.changed() => break,
        };
        let Some(back) = run_step(archiver, step).await else {
            return;
        };
        archiver = back;
        if archiver.has_failed() {
            error!("Archive writer of partition {} failed, stopping", archiver.partition_id());
            return;
        }
    }
    if archiver.current_archive().is_some() {
        run_step(archiver, Step::Seal).await;
    }
    info!("Aggregation worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, PARTITION};
    use std::io::Read;
    use std::time::Duration;
    use tapeio_archive::{open_entry, verify_archive};
    use tapeio_common::{ArchiveLocation, TEMP_ARCHIVE_SUFFIX};

    #[test]
    fn test_entry_sizes() {
        assert_eq!(entry_sizes(0, 10), vec![0]);
        assert_eq!(entry_sizes(10, 10), vec![10]);
        assert_eq!(entry_sizes(25, 10), vec![10, 10, 5]);
    }

    #[test]
    fn test_object_archived_and_write_order_queued_once() {
        let fx = Fixture::new();
        let data = fx.random_bytes(10 * 1024 * 1024);
        let msg = fx.put_input_object("c", "o1", &data);

        let mut archiver = PartitionArchiver::new(fx.archiver_context(), PARTITION);
        archiver.process(&msg).unwrap();
        let archive_id = archiver.seal_current().unwrap().unwrap();

        let object = fx.store.find_object("c", "o1").unwrap().unwrap();
        let ObjectLocation::InTar(entries) = &object.location else {
            panic!("object not archived: {:?}", object.location);
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].archive_id, archive_id);
        assert!(fx.loose.read("c", &msg.storage_id).unwrap().is_none());

        let archive = fx.store.find_archive(&archive_id).unwrap().unwrap();
        assert_eq!(archive.location, ArchiveLocation::ReadyOnDisk);
        assert!(archive.digest.is_some());

        let dir = fx.input_tars_dir().join(PARTITION);
        assert!(dir.join(archive_id.as_str()).is_file());
        assert!(!dir.join(format!("{archive_id}{TEMP_ARCHIVE_SUFFIX}")).exists());
        let whole = verify_archive(&dir.join(archive_id.as_str()), &archive_id, &fx.store, 100).unwrap();
        assert_eq!(Some(whole.digest), archive.digest);

        let orders = fx.store.list_orders().unwrap();
        assert_eq!(orders.len(), 1);
        let QueueOrder::Write(order) = &orders[0].order else {
            panic!("expected a write order");
        };
        assert_eq!(order.relative_path, format!("{PARTITION}/{archive_id}"));
        assert_eq!(order.bucket_id, "bucket");

        // publishing again does not queue a second order
        queue_write_order(
            fx.store.as_ref(),
            fx.topology.as_ref(),
            PARTITION,
            &archive_id,
            &DigestWithSize {
                size: whole.size,
                digest: String::new(),
            },
        )
        .unwrap();
        assert_eq!(fx.store.list_orders().unwrap().len(), 1);
    }

    #[test]
    fn test_large_object_split_across_archives() {
        let fx = Fixture::with_archive_config(ArchiveConfig {
            max_archive_size: 5000,
            max_entry_size: 1000,
            buffering_timeout_secs: 60,
        });
        let data = fx.random_bytes(2500);
        let msg = fx.put_input_object("c", "big", &data);

        let mut archiver = PartitionArchiver::new(fx.archiver_context(), PARTITION);
        archiver.process(&msg).unwrap();
        archiver.seal_current().unwrap();

        let object = fx.store.find_object("c", "big").unwrap().unwrap();
        let ObjectLocation::InTar(entries) = &object.location else {
            panic!("object not archived");
        };
        assert_eq!(entries.iter().map(|e| e.size).collect::<Vec<_>>(), vec![1000, 1000, 500]);
        assert_eq!(object.location.archive_ids().len(), 2);
        assert_eq!(fx.store.list_orders().unwrap().len(), 2);

        let mut read_back = Vec::new();
        for entry in entries {
            let file = fs::File::open(fx.input_tars_dir().join(PARTITION).join(entry.archive_id.as_str())).unwrap();
            open_entry(file, entry).unwrap().read_to_end(&mut read_back).unwrap();
        }
        assert_eq!(read_back, data);
    }

    #[test]
    fn test_stale_messages_are_harmless() {
        let fx = Fixture::new();
        let msg = fx.put_input_object("c", "o1", b"first");
        let mut archiver = PartitionArchiver::new(fx.archiver_context(), PARTITION);
        archiver.process(&msg).unwrap();
        // a duplicate message finds the object archived already
        archiver.process(&msg).unwrap();
        assert!(archiver.current_archive().is_some());

        // overwritten object: the old input file is dropped
        let old = fx.put_input_object("c", "o2", b"old");
        let _new = fx.put_input_object("c", "o2", b"new");
        archiver.process(&old).unwrap();
        assert!(fx.loose.read("c", &old.storage_id).unwrap().is_none());
        assert!(!archiver.has_failed());
    }

    #[test]
    fn test_digest_mismatch_stops_worker() {
        let fx = Fixture::new();
        let msg = fx.put_input_object("c", "o1", b"payload");
        let mut object = fx.store.find_object("c", "o1").unwrap().unwrap();
        object.digest = "0".repeat(128);
        fx.store.put_object(&object).unwrap();

        let mut archiver = PartitionArchiver::new(fx.archiver_context(), PARTITION);
        let err = archiver.process(&msg).unwrap_err();
        assert!(err.is_integrity());
        assert!(archiver.has_failed());
        // the object was not indexed and its input file is kept
        let object = fx.store.find_object("c", "o1").unwrap().unwrap();
        assert_eq!(object.location, ObjectLocation::InputFile);
        assert!(fx.loose.read("c", &msg.storage_id).unwrap().is_some());
        assert!(archiver.process(&msg).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_archive_and_seal_on_shutdown() {
        let fx = Fixture::new();
        let aggregator = Aggregator::start(fx.archiver_context());
        let msg = fx.put_input_object("c", "o1", b"hello");
        aggregator.client().submit(msg).unwrap();

        let mut waited = Duration::ZERO;
        loop {
            let object = fx.store.find_object("c", "o1").unwrap().unwrap();
            if matches!(object.location, ObjectLocation::InTar(_)) || waited > Duration::from_secs(5) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        aggregator.shutdown().await;

        let object = fx.store.find_object("c", "o1").unwrap().unwrap();
        let archive_id = object.location.archive_ids()[0].clone();
        let archive = fx.store.find_archive(&archive_id).unwrap().unwrap();
        assert_eq!(archive.location, ArchiveLocation::ReadyOnDisk);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_archive_sealed_after_buffering_timeout() {
        let fx = Fixture::with_archive_config(ArchiveConfig {
            buffering_timeout_secs: 1,
            ..ArchiveConfig::default()
        });
        let aggregator = Aggregator::start(fx.archiver_context());
        let msg = fx.put_input_object("c", "o1", b"small");
        aggregator.client().submit(msg).unwrap();

        // nothing else arrives, only the timer can seal the archive
        let mut sealed = None;
        let mut waited = Duration::ZERO;
        while sealed.is_none() && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
            let object = fx.store.find_object("c", "o1").unwrap().unwrap();
            if let Some(archive_id) = object.location.archive_ids().first() {
                let archive = fx.store.find_archive(archive_id).unwrap().unwrap();
                if archive.location == ArchiveLocation::ReadyOnDisk {
                    sealed = Some(archive);
                }
            }
        }
        let archive = sealed.expect("archive sealed by the buffering timeout");
        assert!(waited >= Duration::from_millis(900));
        assert!(archive.size.unwrap() < fx.config.archive.max_archive_size);
        assert!(fx
            .store
            .list_orders()
            .unwrap()
            .iter()
            .any(|o| matches!(&o.order, QueueOrder::Write(w) if w.archive_id == archive.archive_id)));
        let dir = fx.input_tars_dir().join(PARTITION);
        assert!(dir.join(archive.archive_id.as_str()).is_file());

        aggregator.shutdown().await;
    }

    #[test]
    fn test_unknown_container_is_rejected() {
        let fx = Fixture::new();
        let client = AggregatorClient {
            topology: Arc::clone(&fx.topology),
            senders: Arc::new(HashMap::new()),
        };
        let err = client
            .submit(InputFileMessage {
                container: "nope".into(),
                object_name: "o".into(),
                storage_id: "o-x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
