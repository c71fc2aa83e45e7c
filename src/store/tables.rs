#![allow(missing_docs)]
// Table Definitions

use redb::{Table, TableDefinition, WriteTransaction};

/// Table: Users
/// Key:   `u64`    # UserId
/// Value: `&[u8]`  # Postcard encoded UserRecord
pub const USERS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("users-1");

/// Table: Clock log
/// Key:   `(u64, u64)` # (UserId, Clock)
/// Value: `&[u8]`      # Postcard encoded LogRecord
pub const LOG_TABLE: TableDefinition<LogId, &[u8]> = TableDefinition::new("log-1");
pub type LogId = (u64, u64);

/// Table: Digest index
/// Key:   `([u8; 32], u64, u64)` # (Digest, UserId, Clock)
/// Value: `()`
pub const BY_DIGEST_TABLE: TableDefinition<ByDigestId, ()> = TableDefinition::new("by-digest-1");
pub type ByDigestId<'a> = (&'a [u8; 32], u64, u64);

/// Table: Replica sets
/// Key:   `u64`    # UserId
/// Value: `&[u8]`  # Postcard encoded ReplicaSet
pub const REPLICA_SETS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("replica-sets-1");

pub struct Tables<'tx> {
    pub users: Table<'tx, u64, &'static [u8]>,
    pub log: Table<'tx, LogId, &'static [u8]>,
    pub by_digest: Table<'tx, ByDigestId<'static>, ()>,
    pub replica_sets: Table<'tx, u64, &'static [u8]>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, redb::TableError> {
        let users = tx.open_table(USERS_TABLE)?;
        let log = tx.open_table(LOG_TABLE)?;
        let by_digest = tx.open_table(BY_DIGEST_TABLE)?;
        let replica_sets = tx.open_table(REPLICA_SETS_TABLE)?;
        Ok(Self {
            users,
            log,
            by_digest,
            replica_sets,
        })
    }
}
