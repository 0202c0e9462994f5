//! Persistent tape order queue
//!
//! Orders are stored under a monotonically increasing sequence number so
//! the tape subsystem consumes them in FIFO order. Orders enqueued with a
//! deduplication key are also indexed by that key until they complete or
//! are cancelled.

use crate::store::{MetaStore, MetaStoreResult};
use crate::tables;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tapeio_common::{OrderQueue, QueueOrder};
use tracing::debug;

/// Processing state of a queued order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Waiting for the tape subsystem
    Ready,
    /// Picked up; can no longer be cancelled
    Running,
}

/// An order as persisted in the queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOrder {
    pub sequence: u64,
    pub dedup_key: Option<String>,
    pub state: OrderState,
    pub order: QueueOrder,
}

impl MetaStore {
    fn push_order(&self, dedup_key: Option<&str>, order: QueueOrder) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        {
            let mut keys = write_txn.open_table(tables::ORDER_KEYS)?;
            if let Some(key) = dedup_key {
                if keys.get(key)?.is_some() {
                    return Ok(false);
                }
            }
            let mut orders = write_txn.open_table(tables::ORDERS)?;
            let sequence = orders.last()?.map_or(0, |(k, _)| k.value() + 1);
            let stored = StoredOrder {
                sequence,
                dedup_key: dedup_key.map(str::to_string),
                state: OrderState::Ready,
                order,
            };
            let bytes = bincode::serialize(&stored)?;
            orders.insert(sequence, bytes.as_slice())?;
            if let Some(key) = dedup_key {
                keys.insert(key, sequence)?;
            }
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Remove the live order registered under `dedup_key` if it is still
    /// waiting. Returns `true` if an order was removed.
    pub fn cancel_order_if_not_started(&self, dedup_key: &str) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let cancelled = {
            let mut keys = write_txn.open_table(tables::ORDER_KEYS)?;
            let mut orders = write_txn.open_table(tables::ORDERS)?;
            let sequence = keys.get(dedup_key)?.map(|v| v.value());
            match sequence {
                Some(sequence) => {
                    let stored = orders.get(sequence)?.map(|v| v.value().to_vec());
                    let state = match stored {
                        Some(bytes) => Some(bincode::deserialize::<StoredOrder>(&bytes)?.state),
                        None => None,
                    };
                    match state {
                        Some(OrderState::Ready) | None => {
                            orders.remove(sequence)?;
                            keys.remove(dedup_key)?;
                            true
                        }
                        Some(OrderState::Running) => false,
                    }
                }
                None => false,
            }
        };
        if cancelled {
            write_txn.commit()?;
        }
        Ok(cancelled)
    }

    /// Take the oldest waiting order and mark it running
    pub fn poll_next_order(&self) -> MetaStoreResult<Option<StoredOrder>> {
        let write_txn = self.db.begin_write()?;
        let polled = {
            let mut orders = write_txn.open_table(tables::ORDERS)?;
            let mut next: Option<StoredOrder> = None;
            for entry in orders.iter()? {
                let (_, bytes) = entry?;
                let stored: StoredOrder = bincode::deserialize(bytes.value())?;
                if stored.state == OrderState::Ready {
                    next = Some(stored);
                    break;
                }
            }
            if let Some(stored) = next.as_mut() {
                stored.state = OrderState::Running;
                let bytes = bincode::serialize(&*stored)?;
                orders.insert(stored.sequence, bytes.as_slice())?;
            }
            next
        };
        if polled.is_some() {
            write_txn.commit()?;
        }
        Ok(polled)
    }

    /// Drop a finished order and release its deduplication key
    pub fn complete_order(&self, sequence: u64) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let completed = {
            let mut orders = write_txn.open_table(tables::ORDERS)?;
            let mut keys = write_txn.open_table(tables::ORDER_KEYS)?;
            let removed = orders.remove(sequence)?.map(|v| v.value().to_vec());
            match removed {
                Some(bytes) => {
                    let stored: StoredOrder = bincode::deserialize(&bytes)?;
                    if let Some(key) = stored.dedup_key.as_deref() {
                        keys.remove(key)?;
                    }
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(completed)
    }

    /// Every queued order, oldest first
    pub fn list_orders(&self) -> MetaStoreResult<Vec<StoredOrder>> {
        let read_txn = self.db.begin_read()?;
        let orders = read_txn.open_table(tables::ORDERS)?;
        let mut result = Vec::new();
        for entry in orders.iter()? {
            let (_, bytes) = entry?;
            result.push(bincode::deserialize(bytes.value())?);
        }
        Ok(result)
    }
}

impl OrderQueue for MetaStore {
    fn enqueue(&self, order: QueueOrder) -> tapeio_common::Result<()> {
        debug!("Enqueuing order for archive {}", order.archive_id());
        self.push_order(None, order)?;
        Ok(())
    }

    fn add_if_absent(&self, dedup_key: &str, order: QueueOrder) -> tapeio_common::Result<bool> {
        let added = self.push_order(Some(dedup_key), order)?;
        if !added {
            debug!("Order {dedup_key} already queued");
        }
        Ok(added)
    }

    fn cancel_if_not_started(&self, dedup_key: &str) -> tapeio_common::Result<bool> {
        Ok(self.cancel_order_if_not_started(dedup_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeio_common::order::read_order_key;
    use tapeio_common::{ArchiveId, ReadOrder, WriteOrder};
    use tempfile::tempdir;

    fn read_order(id: &ArchiveId) -> QueueOrder {
        QueueOrder::Read(ReadOrder {
            tape_code: "TAPE01".into(),
            file_position: 2,
            archive_id: id.clone(),
            bucket_id: "objects".into(),
            partition_id: "p1".into(),
            size: 1024,
        })
    }

    fn write_order(id: &ArchiveId) -> QueueOrder {
        QueueOrder::Write(WriteOrder {
            bucket_id: "objects".into(),
            partition_id: "p1".into(),
            relative_path: format!("p1/{id}"),
            size: 1024,
            digest: "d".into(),
            archive_id: id.clone(),
        })
    }

    #[test]
    fn test_fifo_and_dedup() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        let a = ArchiveId::generate();
        let b = ArchiveId::generate();

        store.enqueue(write_order(&a)).unwrap();
        assert!(store.add_if_absent(&read_order_key(&b), read_order(&b)).unwrap());
        assert!(!store.add_if_absent(&read_order_key(&b), read_order(&b)).unwrap());

        let orders = store.list_orders().unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].order, write_order(&a));
        assert_eq!(orders[1].order, read_order(&b));
    }

    #[test]
    fn test_cancel_only_before_start() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
        let a = ArchiveId::generate();
        let b = ArchiveId::generate();
        let key_a = read_order_key(&a);
        let key_b = read_order_key(&b);

        store.add_if_absent(&key_a, read_order(&a)).unwrap();
        store.add_if_absent(&key_b, read_order(&b)).unwrap();

        // a gets picked up by the tape subsystem
        let running = store.poll_next_order().unwrap().unwrap();
        assert_eq!(running.order, read_order(&a));
        assert!(!store.cancel_if_not_started(&key_a).unwrap());

        assert!(store.cancel_if_not_started(&key_b).unwrap());
        assert!(!store.cancel_if_not_started(&key_b).unwrap());
        // the key is free again
        assert!(store.add_if_absent(&key_b, read_order(&b)).unwrap());

        assert!(store.complete_order(running.sequence).unwrap());
        assert!(store.add_if_absent(&key_a, read_order(&a)).unwrap());
        assert_eq!(store.list_orders().unwrap().len(), 2);
    }
}
