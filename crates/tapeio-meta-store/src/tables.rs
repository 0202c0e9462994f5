//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: "{container}\x00{objectName}", Value: bincode-encoded ObjectEntry
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

// Key: archive id, Value: bincode-encoded ArchiveEntry
pub const ARCHIVES: TableDefinition<&str, &[u8]> = TableDefinition::new("archives");

// Key: request id, Value: bincode-encoded AccessRequest
pub const ACCESS_REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("access_requests");

// Tape order queue
// Key: sequence number (FIFO), Value: bincode-encoded StoredOrder
pub const ORDERS: TableDefinition<u64, &[u8]> = TableDefinition::new("orders");
// Key: deduplication key, Value: sequence number of the live order
pub const ORDER_KEYS: TableDefinition<&str, u64> = TableDefinition::new("order_keys");
