//! Persistent metadata store backed by redb.
//!
//! Holds the three collections of the offer (objects, archives, access
//! requests) plus the tape order queue. Every write is a single redb write
//! transaction, so a conditional update is atomic with respect to any other
//! writer of the same database.

use crate::tables;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Default number of keys per bulk lookup
pub const DEFAULT_BULK_BATCH_SIZE: usize = 1000;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("duplicate key '{key}' in {table}")]
    Duplicate { table: &'static str, key: String },
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for tapeio_common::Error {
    fn from(e: MetaStoreError) -> Self {
        Self::Referential(e.to_string())
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    pub(crate) db: Database,
    pub(crate) bulk_batch_size: usize,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        Self::open_with_batch_size(path, DEFAULT_BULK_BATCH_SIZE)
    }

    /// Open the database, bounding bulk lookups to `bulk_batch_size` keys
    /// per read transaction.
    pub fn open_with_batch_size(
        path: impl AsRef<Path>,
        bulk_batch_size: usize,
    ) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::OBJECTS)?;
            let _t = write_txn.open_table(tables::ARCHIVES)?;
            let _t = write_txn.open_table(tables::ACCESS_REQUESTS)?;
            let _t = write_txn.open_table(tables::ORDERS)?;
            let _t = write_txn.open_table(tables::ORDER_KEYS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            bulk_batch_size: bulk_batch_size.max(1),
        })
    }

    // ---- Generic helpers ----

    pub(crate) fn get_bincode<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        match table.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Look up many keys, one read transaction per batch.
    /// Missing keys are skipped.
    pub(crate) fn bulk_get_bincode<T: DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        keys: &[String],
    ) -> MetaStoreResult<Vec<T>> {
        let mut result = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.bulk_batch_size) {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(table_def)?;
            for key in chunk {
                if let Some(bytes) = table.get(key.as_str())? {
                    result.push(bincode::deserialize(bytes.value())?);
                }
            }
        }
        Ok(result)
    }

    pub(crate) fn put_bincode<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Insert a value, failing if the key already exists.
    pub(crate) fn insert_new_bincode<T: Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        table_name: &'static str,
        key: &str,
        value: &T,
    ) -> MetaStoreResult<()> {
        let bytes = bincode::serialize(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_def)?;
            if table.get(key)?.is_some() {
                return Err(MetaStoreError::Duplicate {
                    table: table_name,
                    key: key.to_string(),
                });
            }
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read, mutate and write back a single record in one write transaction.
    ///
    /// `update` returns `false` to leave the record untouched. The result is
    /// `true` only if a record existed and was rewritten.
    pub(crate) fn update_bincode<T, F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        update: F,
    ) -> MetaStoreResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(table_def)?;
            // Copy the bytes out and drop the guard before mutating
            let current = table.get(key)?.map(|v| v.value().to_vec());
            match current {
                Some(bytes) => {
                    let mut value: T = bincode::deserialize(&bytes)?;
                    if update(&mut value) {
                        let bytes = bincode::serialize(&value)?;
                        table.insert(key, bytes.as_slice())?;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if updated {
            write_txn.commit()?;
        }
        Ok(updated)
    }

    /// Remove a key. Returns `true` if it existed.
    pub(crate) fn delete_key(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table_def)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Remove a key if its current value satisfies `predicate`.
    pub(crate) fn delete_bincode_if<T, F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        predicate: F,
    ) -> MetaStoreResult<bool>
    where
        T: DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(table_def)?;
            let current = table.get(key)?.map(|v| v.value().to_vec());
            match current {
                Some(bytes) if predicate(&bincode::deserialize::<T>(&bytes)?) => {
                    table.remove(key)?;
                    true
                }
                _ => false,
            }
        };
        if deleted {
            write_txn.commit()?;
        }
        Ok(deleted)
    }

    /// Decode every record whose key starts with `prefix` and keep those
    /// matching `filter`.
    pub(crate) fn scan_bincode<T, F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        prefix: &str,
        mut filter: F,
    ) -> MetaStoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_def)?;
        let mut result = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, bytes) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let value: T = bincode::deserialize(bytes.value())?;
            if filter(&value) {
                result.push(value);
            }
        }
        Ok(result)
    }
}
