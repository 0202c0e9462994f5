//! TapeIO Offer - tape-backed object storage
//!
//! Objects are written as loose files, packed per partition into archives
//! that go to tape, and staged back into a disk cache on demand. Access
//! requests track when archived objects become readable again.

pub mod access;
pub mod aggregator;
pub mod bootstrap;
pub mod eviction;
pub mod loose;
pub mod retry;
pub mod staging;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use access::{AccessRequestManager, CleanupReport, CleanupTask};
pub use aggregator::{Aggregator, AggregatorClient, ArchiverContext, InputFileMessage, PartitionArchiver};
pub use bootstrap::{Bootstrap, RecoveryReport};
pub use eviction::{EvictionController, EvictionLockGuard};
pub use loose::{FsLooseObjectStore, LooseObjectStore, StoredFile};
pub use retry::RetryPolicy;
pub use staging::ArchiveStaging;
pub use storage::{ObjectMetadata, ObjectReader, TapeObjectStorage};
