//! Redb table definitions for the cold index tier.

use redb::TableDefinition;

// Key: fast-tier key name, Value: dump of the evicted key
pub const INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("index");
