//! Rebuild a clean archive from a truncated or corrupted one
//!
//! Entries are copied one by one into a fresh archive until the first one
//! that cannot be read completely. Each payload is first spooled to a
//! scratch file, so a failure while reading the damaged input never leaves
//! a half-written entry in the output.
//!
//! Errors raised by the damaged input are tagged on the way out of the
//! input reader. A tagged error (or a truncation detected by the scanner)
//! ends the copy; any other error comes from the output side and aborts
//! the repair.

use crate::scanner::{ArchiveScanner, ScannedEntry};
use crate::writer::ArchiveWriter;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tapeio_common::{ArchiveId, DigestWithSize, Error, Result, TarEntryDescription};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Marker wrapped around I/O errors raised by the damaged input
#[derive(Debug)]
pub struct InputFault(io::Error);

impl fmt::Display for InputFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "damaged input: {}", self.0)
    }
}

impl StdError for InputFault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.0)
    }
}

/// Whether an error was raised by the tagged input
#[must_use]
pub fn is_input_fault(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<InputFault>())
}

/// Reader adapter tagging every error of the wrapped reader
pub struct InputFaultReader<R> {
    inner: R,
}

impl<R: Read> InputFaultReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Read for InputFaultReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::Interrupted || is_input_fault(&e) {
                e
            } else {
                io::Error::new(e.kind(), InputFault(e))
            }
        })
    }
}

/// Scanner failures that mean "the input ends here"
fn is_damaged_input(e: &io::Error) -> bool {
    is_input_fault(e)
        || matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
        )
}

/// Outcome of a repair
#[derive(Debug)]
pub struct RepairReport {
    /// Size and digest of the rebuilt archive
    pub archive: DigestWithSize,
    /// Entries copied, in order, at their original offsets
    pub entries: Vec<TarEntryDescription>,
    /// Whether entries or the footer were missing from the input
    pub truncated: bool,
}

/// Copy the readable prefix of `input` into a new archive at `output`.
///
/// Every copied entry lands at the offset it had in the input; a different
/// offset is reported as an integrity error.
pub fn repair_archive(
    input: &Path,
    output: &Path,
    archive_id: &ArchiveId,
    max_archive_size: u64,
) -> Result<RepairReport> {
    let source = File::open(input)?;
    let mut scanner = ArchiveScanner::new(InputFaultReader::new(BufReader::new(source)));
    let mut writer = ArchiveWriter::create(output, archive_id.clone(), max_archive_size)?;
    let mut spool = Spool::create(output)?;

    let mut entries = Vec::new();
    let mut truncated = false;
    loop {
        let entry = match scanner.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) if is_damaged_input(&e) => {
                warn!("Archive {archive_id} input ends at offset {}: {e}", scanner.offset());
                truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };

        spool.reset()?;
        match scanner.copy_payload(&entry, spool.file_mut()) {
            Ok(()) => {}
            Err(e) if is_damaged_input(&e) => {
                warn!(
                    "Archive {archive_id}: entry {} at offset {} is incomplete: {e}",
                    entry.name, entry.start_offset
                );
                truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }

        entries.push(copy_entry(&mut writer, &mut spool, &entry)?);

        // A fully read entry is kept even if its padding is cut short
        if let Err(e) = scanner.skip_padding(&entry) {
            if !is_damaged_input(&e) {
                return Err(e.into());
            }
            truncated = true;
            break;
        }
    }

    spool.remove();
    let archive = writer.finish()?;
    info!(
        "Repaired archive {archive_id}: kept {} entries, {} bytes{}",
        entries.len(),
        archive.size,
        if truncated { ", input was truncated" } else { "" }
    );
    Ok(RepairReport {
        archive,
        entries,
        truncated,
    })
}

fn copy_entry(
    writer: &mut ArchiveWriter,
    spool: &mut Spool,
    entry: &ScannedEntry,
) -> Result<TarEntryDescription> {
    if !writer.can_append(entry.size) {
        return Err(Error::integrity(format!(
            "entry {} at offset {} exceeds the archive size limit",
            entry.name, entry.start_offset
        )));
    }
    let file = spool.rewind()?;
    let copied = writer.append(&entry.name, file, entry.size)?;
    if copied.start_offset != entry.start_offset {
        return Err(Error::integrity(format!(
            "entry {} moved from offset {} to {} during repair",
            entry.name, entry.start_offset, copied.start_offset
        )));
    }
    Ok(copied)
}

/// File name suffix of repair scratch files
pub const REPAIR_SPOOL_SUFFIX: &str = ".spool";

/// Scratch file holding one entry payload at a time, named
/// `{output}.{random}.spool` next to the output and removed when dropped
struct Spool {
    file: NamedTempFile,
}

impl Spool {
    fn create(output: &Path) -> Result<Self> {
        let dir = output
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut prefix = output.file_name().unwrap_or_default().to_owned();
        prefix.push(".");
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(REPAIR_SPOOL_SUFFIX)
            .tempfile_in(dir)?;
        Ok(Self { file })
    }

    fn reset(&mut self) -> Result<()> {
        let file = self.file.as_file_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn file_mut(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    fn rewind(&mut self) -> Result<&mut File> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    fn remove(self) {
        let path = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!("Failed to remove repair spool {}: {e}", path.display());
        }
    }
}
