//! TapeIO Archive - append-only TAR archives
//!
//! Objects are packed into TAR files readable by standard tools. This crate
//! writes them, reads entries back by offset, verifies entry digests
//! against the object index and rebuilds archives damaged by a crash.

pub mod format;
pub mod repair;
pub mod scanner;
pub mod verifier;
pub mod writer;

pub use repair::{REPAIR_SPOOL_SUFFIX, RepairReport, repair_archive};
pub use scanner::{ArchiveScanner, ScannedEntry, open_entry};
pub use verifier::{DigestVerifier, verify_archive};
pub use writer::ArchiveWriter;
