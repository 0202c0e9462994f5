//! Archive digest verification
//!
//! Entry digests recomputed from an archive are checked against the
//! digests recorded in the object index. Checks are buffered and run in
//! batches so a large archive costs one bulk lookup per batch and
//! container rather than one per entry.

use crate::scanner::ArchiveScanner;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tapeio_common::checksum::{HashingReader, HashingWriter};
use tapeio_common::{ArchiveId, DigestWithSize, EntryName, Error, ObjectLocation, Result};
use tapeio_meta_store::MetaStore;
use tracing::{debug, info};

/// Buffers entry digests and checks them against the object index
pub struct DigestVerifier<'a> {
    store: &'a MetaStore,
    archive_id: ArchiveId,
    batch_size: usize,
    pending: Vec<(EntryName, String)>,
    checked: usize,
}

impl<'a> DigestVerifier<'a> {
    pub fn new(store: &'a MetaStore, archive_id: ArchiveId, batch_size: usize) -> Self {
        Self {
            store,
            archive_id,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            checked: 0,
        }
    }

    /// Queue one entry for checking; runs a batch when the buffer is full
    pub fn add_digest_to_check(&mut self, entry_name: &str, digest: impl Into<String>) -> Result<()> {
        self.pending.push((EntryName::parse(entry_name)?, digest.into()));
        if self.pending.len() >= self.batch_size {
            self.check_pending()?;
        }
        Ok(())
    }

    /// Check whatever is still buffered. Returns the number of entries
    /// checked over the verifier's lifetime.
    pub fn finalize_checks(mut self) -> Result<usize> {
        self.check_pending()?;
        Ok(self.checked)
    }

    fn check_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);

        let mut by_container: HashMap<&str, Vec<String>> = HashMap::new();
        for (name, _) in &batch {
            by_container
                .entry(name.container.as_str())
                .or_default()
                .push(name.object_name()?.to_string());
        }

        let mut objects = HashMap::new();
        for (container, names) in by_container {
            for object in self.store.bulk_find_objects(container, &names)? {
                objects.insert((object.container.clone(), object.object_name.clone()), object);
            }
        }

        for (name, digest) in &batch {
            let key = (name.container.clone(), name.object_name()?.to_string());
            let Some(object) = objects.get(&key) else {
                debug!("Entry {name} belongs to a deleted object, skipping");
                continue;
            };
            if object.storage_id != name.storage_id {
                debug!("Entry {name} belongs to an overwritten object, skipping");
                continue;
            }
            let ObjectLocation::InTar(entries) = &object.location else {
                debug!("Entry {name} not indexed yet, skipping");
                continue;
            };
            let entry_name = name.to_string();
            let Some(recorded) = entries
                .iter()
                .find(|e| e.archive_id == self.archive_id && e.entry_name == entry_name)
            else {
                debug!("Entry {name} is not referenced by its object, skipping");
                continue;
            };
            if recorded.entry_digest != *digest {
                return Err(Error::integrity(format!(
                    "digest mismatch for entry {name} of archive {}: recorded {}, actual {digest}",
                    self.archive_id, recorded.entry_digest
                )));
            }
        }
        self.checked += batch.len();
        Ok(())
    }
}

/// Re-read a complete archive, check every entry digest against the index
/// and return size and digest of the whole file.
pub fn verify_archive(
    path: &Path,
    archive_id: &ArchiveId,
    store: &MetaStore,
    batch_size: usize,
) -> Result<DigestWithSize> {
    let file = File::open(path)?;
    let mut scanner = ArchiveScanner::new(HashingReader::new(BufReader::new(file)));
    let mut verifier = DigestVerifier::new(store, archive_id.clone(), batch_size);

    let corrupted = |e: io::Error, offset: u64| {
        Error::integrity(format!("archive {archive_id} is unreadable at offset {offset}: {e}"))
    };

    loop {
        let entry = match scanner.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(corrupted(e, scanner.offset())),
        };
        let mut sink = HashingWriter::new(io::sink());
        scanner
            .copy_payload(&entry, &mut sink)
            .and_then(|()| scanner.skip_padding(&entry))
            .map_err(|e| corrupted(e, entry.start_offset))?;
        let (_, digest) = sink.into_parts();
        verifier.add_digest_to_check(&entry.name, digest.digest)?;
    }
    let checked = verifier.finalize_checks()?;

    // Second footer block
    let mut reader = scanner.into_inner();
    io::copy(&mut reader, &mut io::sink())?;
    let whole = reader.finalize();

    info!("Verified archive {archive_id}: {checked} entries, {} bytes", whole.size);
    Ok(whole)
}
