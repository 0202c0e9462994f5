//! Tape read/write orders
//!
//! Orders are the unit of work handed over to the tape subsystem. The
//! offer produces write orders for sealed archives and read orders for
//! archives an access request is waiting for.

use crate::error::Result;
use crate::types::ArchiveId;
use serde::{Deserialize, Serialize};

/// Ask the tape subsystem to copy a sealed archive to tape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOrder {
    pub bucket_id: String,
    pub partition_id: String,
    /// Path relative to the input tars directory: `{partition}/{archiveId}`
    pub relative_path: String,
    pub size: u64,
    pub digest: String,
    pub archive_id: ArchiveId,
}

/// Ask the tape subsystem to stage an archive back into the disk cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOrder {
    pub tape_code: String,
    pub file_position: u32,
    pub archive_id: ArchiveId,
    pub bucket_id: String,
    pub partition_id: String,
    pub size: u64,
}

/// Any order carried by the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOrder {
    Write(WriteOrder),
    Read(ReadOrder),
}

impl QueueOrder {
    #[must_use]
    pub const fn archive_id(&self) -> &ArchiveId {
        match self {
            Self::Write(o) => &o.archive_id,
            Self::Read(o) => &o.archive_id,
        }
    }
}

/// Deduplication key of the read order of an archive
#[must_use]
pub fn read_order_key(archive_id: &ArchiveId) -> String {
    format!("read:{archive_id}")
}

/// Deduplication key of the write order of an archive
#[must_use]
pub fn write_order_key(archive_id: &ArchiveId) -> String {
    format!("write:{archive_id}")
}

/// Queue of orders consumed by the tape subsystem
pub trait OrderQueue: Send + Sync {
    /// Append an order unconditionally
    fn enqueue(&self, order: QueueOrder) -> Result<()>;

    /// Append an order unless a live order with the same key exists.
    /// Returns `true` if the order was added.
    fn add_if_absent(&self, dedup_key: &str, order: QueueOrder) -> Result<bool>;

    /// Drop the order registered under `dedup_key` if the tape subsystem
    /// has not picked it up yet. Returns `true` if an order was removed.
    fn cancel_if_not_started(&self, dedup_key: &str) -> Result<bool>;
}
