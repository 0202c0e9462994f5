//! Sequential and random-access archive readers

use crate::format::{HEADER_SIZE, decode_header, invalid_data, padded_size};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use tapeio_common::{Error, Result, TarEntryDescription};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Entry header found while scanning an archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedEntry {
    pub name: String,
    /// Offset of the header block
    pub start_offset: u64,
    pub size: u64,
}

/// Walks an archive entry by entry, tracking byte offsets.
///
/// Truncation is reported as `UnexpectedEof` and malformed headers as
/// `InvalidData`. Errors of the underlying reader are passed through as is.
pub struct ArchiveScanner<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> ArchiveScanner<R> {
    pub const fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Bytes consumed so far
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next header. Returns `Ok(None)` at the first zero block.
    pub fn next_entry(&mut self) -> io::Result<Option<ScannedEntry>> {
        let start_offset = self.offset;
        let mut block = [0u8; HEADER_SIZE as usize];
        let n = read_full(&mut self.reader, &mut block)?;
        self.offset += n as u64;
        if n < block.len() {
            return Err(unexpected_eof(start_offset, "header"));
        }
        Ok(decode_header(&block)?.map(|header| ScannedEntry {
            name: header.name,
            start_offset,
            size: header.size,
        }))
    }

    /// Stream exactly `entry.size` payload bytes into `out`
    pub fn copy_payload<W: Write>(&mut self, entry: &ScannedEntry, out: &mut W) -> io::Result<()> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = entry.size;
        while remaining > 0 {
            let want = usize::try_from(remaining.min(COPY_BUFFER_SIZE as u64)).unwrap_or(COPY_BUFFER_SIZE);
            let n = read_full(&mut self.reader, &mut buf[..want])?;
            self.offset += n as u64;
            out.write_all(&buf[..n])?;
            if n < want {
                return Err(unexpected_eof(entry.start_offset, "payload"));
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Skip the zero padding following a payload
    pub fn skip_padding(&mut self, entry: &ScannedEntry) -> io::Result<()> {
        let padding = padded_size(entry.size) - entry.size;
        let mut block = [0u8; HEADER_SIZE as usize];
        // padding is always shorter than one block
        let want = usize::try_from(padding).unwrap_or(0);
        let n = read_full(&mut self.reader, &mut block[..want])?;
        self.offset += n as u64;
        if n < want {
            return Err(unexpected_eof(entry.start_offset, "padding"));
        }
        Ok(())
    }
}

/// Read until `buf` is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn unexpected_eof(entry_offset: u64, part: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("archive truncated in {part} of entry at offset {entry_offset}"),
    )
}

/// Open one entry of an archive by its recorded offset.
///
/// The header found at the offset must carry the expected name and size;
/// anything else means the record and the file disagree.
pub fn open_entry(file: File, entry: &TarEntryDescription) -> Result<io::Take<BufReader<File>>> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(entry.start_offset))?;

    let mut block = [0u8; HEADER_SIZE as usize];
    let n = read_full(&mut reader, &mut block)?;
    if n < block.len() {
        return Err(Error::integrity(format!(
            "archive {} has no entry header at offset {}",
            entry.archive_id, entry.start_offset
        )));
    }
    let header = decode_header(&block)
        .map_err(|e| {
            Error::integrity(format!(
                "archive {} has a corrupted header at offset {}: {e}",
                entry.archive_id, entry.start_offset
            ))
        })?
        .ok_or_else(|| invalid_entry(entry, "zero block"))?;
    if header.name != entry.entry_name || header.size != entry.size {
        return Err(invalid_entry(
            entry,
            &format!("found {} ({} bytes)", header.name, header.size),
        ));
    }
    Ok(reader.take(entry.size))
}

fn invalid_entry(entry: &TarEntryDescription, found: &str) -> Error {
    Error::integrity(format!(
        "archive {} offset {}: expected entry {} ({} bytes), {found}",
        entry.archive_id, entry.start_offset, entry.entry_name, entry.size
    ))
}
