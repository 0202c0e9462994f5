//! Core type definitions for the TapeIO offer
//!
//! This module defines the identifiers and the persistent records shared
//! by the aggregation, cache and access-request components.

use crate::checksum::DigestAlgorithm;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Maximum length of a single path segment used on disk
const MAX_SEGMENT_LEN: usize = 255;

/// Check that a name can be used as a single path segment without escaping
/// its parent directory.
#[must_use]
pub fn is_safe_path_segment(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SEGMENT_LEN
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Validate a path segment, failing with an illegal state error
pub fn ensure_safe_path_segment(name: &str) -> Result<()> {
    if is_safe_path_segment(name) {
        Ok(())
    } else {
        Err(Error::illegal_state(format!("unsafe path segment: {name:?}")))
    }
}

/// Unique, time-ordered identifier of an archive file
///
/// The textual form sorts in creation order: a UTC timestamp with
/// millisecond precision followed by a random suffix.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ArchiveId(String);

impl ArchiveId {
    /// Generate a new archive id
    #[must_use]
    pub fn generate() -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}.tar", now.format("%Y%m%d%H%M%S%3f"), &suffix[..12]))
    }

    /// Parse an archive id found on disk or in a record
    pub fn parse(s: &str) -> Result<Self> {
        ensure_safe_path_segment(s)?;
        if !s.ends_with(".tar") {
            return Err(Error::illegal_state(format!("not an archive id: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    /// Create without validation (tests and trusted records only)
    #[must_use]
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used while the archive is still being built
    #[must_use]
    pub fn temp_file_name(&self) -> String {
        format!("{}{TEMP_ARCHIVE_SUFFIX}", self.0)
    }
}

impl fmt::Debug for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveId({})", self.0)
    }
}

/// Suffix of archive files still being written
pub const TEMP_ARCHIVE_SUFFIX: &str = ".tmp";

/// Opaque access request token
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct AccessRequestId(String);

impl AccessRequestId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessRequestId({})", self.0)
    }
}

/// Length of the random suffix appended to object names in storage ids
const STORAGE_ID_SUFFIX_LEN: usize = 32;

/// Build a fresh storage id for an object: `{objectName}-{uuid}`
#[must_use]
pub fn new_storage_id(object_name: &str) -> String {
    format!("{object_name}-{}", Uuid::new_v4().simple())
}

/// Recover the object name from a storage id
pub fn object_name_of_storage_id(storage_id: &str) -> Result<&str> {
    let split = storage_id
        .len()
        .checked_sub(STORAGE_ID_SUFFIX_LEN + 1)
        .filter(|&i| i > 0 && storage_id.as_bytes()[i] == b'-')
        .ok_or_else(|| Error::illegal_state(format!("invalid storage id: {storage_id:?}")))?;
    Ok(&storage_id[..split])
}

/// Name of an entry inside an archive: `{container}/{storageId}-{entryIndex}`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryName {
    pub container: String,
    pub storage_id: String,
    pub index: u32,
}

impl EntryName {
    #[must_use]
    pub fn new(container: impl Into<String>, storage_id: impl Into<String>, index: u32) -> Self {
        Self {
            container: container.into(),
            storage_id: storage_id.into(),
            index,
        }
    }

    /// Parse an entry name read back from an archive
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || Error::integrity(format!("invalid archive entry name: {name:?}"));
        let (container, rest) = name.split_once('/').ok_or_else(invalid)?;
        let (storage_id, index) = rest.rsplit_once('-').ok_or_else(invalid)?;
        let index = index.parse::<u32>().map_err(|_| invalid())?;
        if container.is_empty() || storage_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(container, storage_id, index))
    }

    /// Object name encoded in the storage id
    pub fn object_name(&self) -> Result<&str> {
        object_name_of_storage_id(&self.storage_id)
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.container, self.storage_id, self.index)
    }
}

/// Position of one slice of an object inside an archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TarEntryDescription {
    pub archive_id: ArchiveId,
    pub entry_name: String,
    /// Byte offset of the entry header inside the archive
    pub start_offset: u64,
    pub size: u64,
    pub entry_digest: String,
}

/// Where the bytes of an object currently live
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectLocation {
    /// Still a loose file in the input files directory
    InputFile,
    /// Packed into one or more archive entries, in order
    InTar(Vec<TarEntryDescription>),
}

impl ObjectLocation {
    /// Archives holding the object, without duplicates, in entry order
    #[must_use]
    pub fn archive_ids(&self) -> Vec<ArchiveId> {
        match self {
            Self::InputFile => Vec::new(),
            Self::InTar(entries) => {
                let mut ids: Vec<ArchiveId> = Vec::with_capacity(entries.len());
                for entry in entries {
                    if !ids.contains(&entry.archive_id) {
                        ids.push(entry.archive_id.clone());
                    }
                }
                ids
            }
        }
    }
}

/// One logical object stored in the offer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub container: String,
    pub object_name: String,
    /// Id of the loose file the current version was written to
    pub storage_id: String,
    pub size: u64,
    pub digest_algorithm: DigestAlgorithm,
    pub digest: String,
    pub location: ObjectLocation,
    pub last_access: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Where an archive currently lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveLocation {
    /// Being appended to in the input tars directory
    BuildingOnDisk,
    /// Sealed in the input tars directory, waiting for tape
    ReadyOnDisk,
    /// Written to tape
    OnTape { tape_code: String, file_position: u32 },
}

impl ArchiveLocation {
    /// Position in the one-way lifecycle
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::BuildingOnDisk => 0,
            Self::ReadyOnDisk => 1,
            Self::OnTape { .. } => 2,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BuildingOnDisk => "BuildingOnDisk",
            Self::ReadyOnDisk => "ReadyOnDisk",
            Self::OnTape { .. } => "OnTape",
        }
    }
}

/// One physical archive file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub archive_id: ArchiveId,
    /// Partition (file bucket) the archive was built for
    pub partition_id: String,
    pub location: ArchiveLocation,
    /// Set once, when the archive becomes ready
    pub size: Option<u64>,
    /// Set once, when the archive becomes ready
    pub digest: Option<String>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ArchiveEntry {
    /// A fresh record for an archive about to be created
    #[must_use]
    pub fn building(archive_id: ArchiveId, partition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            archive_id,
            partition_id: partition_id.into(),
            location: ArchiveLocation::BuildingOnDisk,
            size: None,
            digest: None,
            created: now,
            last_updated: now,
        }
    }
}

/// Client request for the eventual availability of a set of objects
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub request_id: AccessRequestId,
    pub container: String,
    pub object_names: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub ready_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub purge_date: Option<DateTime<Utc>>,
    pub unavailable_archive_ids: BTreeSet<ArchiveId>,
    pub tenant: u32,
    /// Optimistic concurrency counter
    pub version: u64,
}

impl AccessRequest {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready_date.is_some()
    }

    /// Expired once the expiration date has passed
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|d| d < now)
    }
}

/// Status of an access request as seen by a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessRequestStatus {
    NotFound,
    Expired,
    Ready,
    NotReady,
}

impl fmt::Display for AccessRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::Ready => "READY",
            Self::NotReady => "NOT_READY",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_segments() {
        assert!(is_safe_path_segment("bucket-1"));
        assert!(is_safe_path_segment("20240101120000123-abc.tar"));
        assert!(!is_safe_path_segment(""));
        assert!(!is_safe_path_segment(".."));
        assert!(!is_safe_path_segment("a/b"));
        assert!(!is_safe_path_segment("a\\b"));
        assert!(!is_safe_path_segment(&"x".repeat(300)));
    }

    #[test]
    fn test_archive_ids_are_time_ordered() {
        let a = ArchiveId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ArchiveId::generate();
        assert!(a < b);
        assert!(ArchiveId::parse(a.as_str()).is_ok());
        assert!(ArchiveId::parse(&a.temp_file_name()).is_err());
        assert!(ArchiveId::parse("../evil.tar").is_err());
    }

    #[test]
    fn test_storage_id_roundtrip() {
        let storage_id = new_storage_id("my-object.pdf");
        assert_eq!(object_name_of_storage_id(&storage_id).unwrap(), "my-object.pdf");
        assert!(object_name_of_storage_id("short").is_err());
    }

    #[test]
    fn test_entry_name_parse() {
        let storage_id = new_storage_id("obj-1");
        let name = EntryName::new("container", storage_id.clone(), 12);
        let text = name.to_string();
        assert_eq!(text, format!("container/{storage_id}-12"));

        let parsed = EntryName::parse(&text).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.object_name().unwrap(), "obj-1");

        assert!(EntryName::parse("no-slash-3").is_err());
        assert!(EntryName::parse("c/obj-x").is_err());
        assert!(EntryName::parse("/obj-1").is_err());
    }

    #[test]
    fn test_location_archive_ids_dedup() {
        let entry = |id: &str, i: u32| TarEntryDescription {
            archive_id: ArchiveId::new_unchecked(id),
            entry_name: format!("c/o-{i}"),
            start_offset: u64::from(i) * 1024,
            size: 10,
            entry_digest: String::new(),
        };
        let loc = ObjectLocation::InTar(vec![entry("a.tar", 0), entry("a.tar", 1), entry("b.tar", 2)]);
        assert_eq!(
            loc.archive_ids(),
            vec![ArchiveId::new_unchecked("a.tar"), ArchiveId::new_unchecked("b.tar")]
        );
        assert!(ObjectLocation::InputFile.archive_ids().is_empty());
    }

    #[test]
    fn test_location_rank_is_monotone() {
        let on_tape = ArchiveLocation::OnTape {
            tape_code: "VIT0001".into(),
            file_position: 3,
        };
        assert!(ArchiveLocation::BuildingOnDisk.rank() < ArchiveLocation::ReadyOnDisk.rank());
        assert!(ArchiveLocation::ReadyOnDisk.rank() < on_tape.rank());
    }
}
