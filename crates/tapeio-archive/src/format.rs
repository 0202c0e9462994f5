//! TAR block arithmetic and header encoding
//!
//! Archives use plain 512-byte blocks: one header block per entry, the
//! payload padded to a whole number of blocks, and two zero blocks as the
//! footer. No record-size rounding is applied to the footer, so every offset
//! can be recomputed from entry sizes alone.

use std::io;
use tapeio_common::{Error, Result};
use tar::{EntryType, Header};

/// Size of a TAR block
pub const BLOCK_SIZE: u64 = 512;

/// Size of an entry header; names are kept short enough to fit one block
pub const HEADER_SIZE: u64 = BLOCK_SIZE;

/// Two zero blocks mark the end of an archive
pub const FOOTER_SIZE: u64 = 2 * BLOCK_SIZE;

/// Longest entry name stored without extension headers
pub const MAX_ENTRY_NAME_LEN: usize = 100;

/// Payload size rounded up to whole blocks
#[must_use]
pub const fn padded_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Bytes occupied by an entry: header plus padded payload
#[must_use]
pub const fn entry_span(size: u64) -> u64 {
    HEADER_SIZE + padded_size(size)
}

/// Encode the header block of a regular file entry
pub fn encode_header(name: &str, size: u64) -> Result<[u8; 512]> {
    if name.is_empty() || name.len() > MAX_ENTRY_NAME_LEN {
        return Err(Error::illegal_state(format!(
            "archive entry name must be 1 to {MAX_ENTRY_NAME_LEN} bytes: {name:?}"
        )));
    }
    let mut header = Header::new_ustar();
    header.set_path(name)?;
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    Ok(*header.as_bytes())
}

/// A decoded entry header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedHeader {
    pub name: String,
    pub size: u64,
}

/// Decode a header block. Returns `Ok(None)` for a zero block.
///
/// Checksum or field errors are reported as `InvalidData`.
pub fn decode_header(block: &[u8; 512]) -> io::Result<Option<DecodedHeader>> {
    if block.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let header = Header::from_byte_slice(block);

    let mut expected = header.clone();
    expected.set_cksum();
    if header.cksum()? != expected.cksum()? {
        return Err(invalid_data("header checksum mismatch"));
    }
    if header.entry_type() != EntryType::Regular {
        return Err(invalid_data("unexpected entry type"));
    }
    let size = header.entry_size()?;
    let name = String::from_utf8(header.path_bytes().into_owned())
        .map_err(|_| invalid_data("entry name is not UTF-8"))?;
    Ok(Some(DecodedHeader { name, size }))
}

pub(crate) fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
