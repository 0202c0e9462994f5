//! Append-only archive writer
//!
//! Builds a TAR file entry by entry while hashing the whole file on the
//! fly. Once an append fails the writer closes itself: the file on disk is
//! then only good for the repairer.

use crate::format::{FOOTER_SIZE, encode_header, entry_span, padded_size};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tapeio_common::checksum::HashingWriter;
use tapeio_common::{ArchiveId, DigestCalculator, DigestWithSize, Error, Result, TarEntryDescription};
use tracing::{debug, error};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const ZEROS: [u8; 1024] = [0u8; 1024];

/// Writer for a single archive file
pub struct ArchiveWriter {
    archive_id: ArchiveId,
    path: PathBuf,
    /// `None` once the writer is closed
    out: Option<HashingWriter<BufWriter<File>>>,
    offset: u64,
    max_size: u64,
    entry_count: usize,
}

impl ArchiveWriter {
    /// Create a new archive file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, archive_id: ArchiveId, max_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        debug!("Created archive {archive_id} at {}", path.display());
        Ok(Self {
            archive_id,
            path,
            out: Some(HashingWriter::new(BufWriter::new(file))),
            offset: 0,
            max_size,
            entry_count: 0,
        })
    }

    pub const fn archive_id(&self) -> &ArchiveId {
        &self.archive_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub const fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    /// Whether an entry of `size` bytes still fits, footer included
    #[must_use]
    pub const fn can_append(&self, size: u64) -> bool {
        self.out.is_some() && self.offset + entry_span(size) + FOOTER_SIZE < self.max_size
    }

    /// Append an entry holding exactly `size` bytes read from `reader`.
    ///
    /// The returned description carries the offset of the entry header and
    /// the digest of the payload alone.
    pub fn append<R: Read>(
        &mut self,
        entry_name: &str,
        reader: &mut R,
        size: u64,
    ) -> Result<TarEntryDescription> {
        if self.out.is_none() {
            return Err(Error::illegal_state(format!(
                "archive {} writer is closed",
                self.archive_id
            )));
        }
        if !self.can_append(size) {
            return Err(Error::illegal_state(format!(
                "entry {entry_name} ({size} bytes) does not fit in archive {} at offset {}",
                self.archive_id, self.offset
            )));
        }
        let header = encode_header(entry_name, size)?;

        let start_offset = self.offset;
        match self.write_entry(&header, reader, size) {
            Ok(entry_digest) => {
                self.offset += entry_span(size);
                self.entry_count += 1;
                Ok(TarEntryDescription {
                    archive_id: self.archive_id.clone(),
                    entry_name: entry_name.to_string(),
                    start_offset,
                    size,
                    entry_digest,
                })
            }
            Err(e) => {
                error!(
                    "Failed to append {entry_name} to archive {}, closing writer: {e}",
                    self.archive_id
                );
                self.out = None;
                Err(e)
            }
        }
    }

    fn write_entry<R: Read>(&mut self, header: &[u8; 512], reader: &mut R, size: u64) -> Result<String> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::illegal_state("archive writer is closed"))?;
        out.write_all(header)?;

        let mut entry_digest = DigestCalculator::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut limited = reader.take(size);
        loop {
            let n = match limited.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            entry_digest.update(&buf[..n]);
            out.write_all(&buf[..n])?;
        }
        if entry_digest.bytes() != size {
            return Err(Error::illegal_state(format!(
                "entry stream ended after {} of {size} bytes",
                entry_digest.bytes()
            )));
        }

        let padding = usize::try_from(padded_size(size) - size).unwrap_or(0);
        out.write_all(&ZEROS[..padding])?;
        Ok(entry_digest.finalize_hex())
    }

    /// Push buffered bytes to the OS and wait until they reach the disk
    pub fn flush(&mut self) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| Error::illegal_state(format!("archive {} writer is closed", self.archive_id)))?;
        let synced = out.flush().and_then(|()| out.get_ref().get_ref().sync_data());
        if let Err(e) = synced {
            error!("Failed to sync archive {}, closing writer: {e}", self.archive_id);
            self.out = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Write the footer, sync and close. Returns size and digest of the
    /// whole file.
    pub fn finish(mut self) -> Result<DigestWithSize> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| Error::illegal_state(format!("archive {} writer is closed", self.archive_id)))?;
        out.write_all(&ZEROS)?;
        out.flush()?;
        let (writer, digest) = out.into_parts();
        let file = writer.into_inner().map_err(std::io::IntoInnerError::into_error)?;
        file.sync_all()?;
        debug!(
            "Sealed archive {} ({} entries, {} bytes)",
            self.archive_id, self.entry_count, digest.size
        );
        Ok(digest)
    }
}
