//! TapeIO Metadata Store - persistent state of the offer
//!
//! Typed access to object locations, archive locations and access
//! requests, plus the tape order queue, over an embedded redb database.
//! "Not found" is always an empty result, never an error.

pub mod access_requests;
pub mod archives;
pub mod objects;
pub mod queue;
pub mod store;
pub mod tables;

pub use queue::{OrderState, StoredOrder};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
