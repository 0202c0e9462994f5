//! TapeIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, persistent record types, error
//! definitions, configuration and collaborator traits used across all
//! TapeIO offer components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod order;
pub mod topology;
pub mod types;

pub use checksum::{DigestAlgorithm, DigestCalculator, DigestWithSize};
pub use config::OfferConfig;
pub use error::{Error, Result};
pub use order::{OrderQueue, QueueOrder, ReadOrder, WriteOrder};
pub use topology::{StaticTopology, TopologyResolver};
pub use types::*;
