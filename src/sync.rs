//! The replica-to-replica synchronization protocol.
//!
//! Replicas exchange three things: digest summaries (to detect divergence),
//! entry exports (log entries plus content bytes) and apply batches (the push
//! side of a sync job). All three are idempotent: replaying any request
//! against a replica that already holds the data is a no-op.
//!
//! [`apply`] is the receiving side, [`transfer`] the sending side.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    digest::Summary,
    store::{LogEntry, Store, UserId},
};

pub mod apply;
pub mod transfer;

/// Header carrying the shared cluster secret on node-to-node requests.
pub const SYNC_SECRET_HEADER: &str = "x-sync-secret";

/// One log entry together with its content bytes, as shipped between
/// replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    /// The log entry.
    pub entry: LogEntry,
    /// The content bytes. `None` for skipped entries, whose bytes are
    /// intentionally not replicated.
    pub content: Option<Bytes>,
}

/// A batch of entries pushed to a replica, in ascending clock order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyBatch {
    /// The owning user.
    pub user_id: UserId,
    /// The owner's wallet.
    pub wallet: String,
    /// The entries, ascending by clock.
    pub entries: Vec<SyncEntry>,
}

/// The receiver's state after an apply batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// The user the batch was for.
    pub user_id: UserId,
    /// The receiver's clock after the batch. Entries up to here are durable.
    pub applied_up_to: u64,
    /// Number of entries parked in the gap buffer, waiting for earlier
    /// clocks.
    pub buffered: usize,
}

/// A replica's digest summary over a clock range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DigestResponse {
    /// The user the summary is for.
    pub user_id: UserId,
    /// The replica's current clock for the user.
    pub clock: u64,
    /// Summary over the requested range. `None` when the replica has no log
    /// for the user at all, as opposed to the summary of an empty range.
    pub summary: Option<Summary>,
}

/// A range of a user's log, exported for another replica to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    /// The owning user.
    pub user_id: UserId,
    /// The owner's wallet.
    pub wallet: String,
    /// The exporting replica's current clock for the user.
    pub clock: u64,
    /// The exported entries, ascending by clock.
    pub entries: Vec<SyncEntry>,
}

/// Bytes of content after which an export stops adding entries. A single
/// entry may exceed this; it then ships alone.
const EXPORT_BYTE_BUDGET: u64 = 8 * 1024 * 1024;

/// Export the user's entries in `(low, high]` with their content bytes, at
/// most `limit` of them and roughly [`EXPORT_BYTE_BUDGET`] bytes.
///
/// `high` is capped to the user's current clock. Returns `None` for users
/// without a log. Skipped entries ship without bytes; for all others a
/// missing blob is an invariant violation, not a soft miss.
pub(crate) async fn export_entries(
    store: &Store,
    user_id: UserId,
    low: u64,
    high: u64,
    limit: u64,
) -> Result<Option<ExportResponse>> {
    let Some(user) = store.get_user(user_id)? else {
        return Ok(None);
    };
    let high = high.min(user.clock);
    let mut entries = Vec::new();
    let mut bytes_total = 0u64;
    for entry in store.entries_in_range(user_id, low, high, limit)? {
        if !entries.is_empty() && bytes_total >= EXPORT_BYTE_BUDGET {
            break;
        }
        let content = if entry.skipped {
            None
        } else {
            let bytes = store.get_content(&entry.digest).await?.with_context(|| {
                format!(
                    "blob {} referenced by log entry ({user_id}, {}) is missing",
                    entry.digest.fmt_short(),
                    entry.clock
                )
            })?;
            bytes_total += bytes.len() as u64;
            Some(bytes)
        };
        entries.push(SyncEntry { entry, content });
    }
    Ok(Some(ExportResponse {
        user_id,
        wallet: user.wallet,
        clock: user.clock,
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        digest::Digest,
        store::{PutContent, StoreOptions},
    };

    #[tokio::test]
    async fn export_ships_entries_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=5 {
            store
                .put_content(PutContent {
                    user_id: UserId(1),
                    wallet: "0xw".to_string(),
                    entity_id: None,
                    gated: false,
                    bytes: Bytes::copy_from_slice(&i.to_le_bytes()),
                })
                .await
                .unwrap();
        }

        assert!(export_entries(&store, UserId(2), 0, 5, 100)
            .await
            .unwrap()
            .is_none());

        let export = export_entries(&store, UserId(1), 2, 100, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(export.clock, 5);
        let clocks: Vec<_> = export.entries.iter().map(|e| e.entry.clock).collect();
        assert_eq!(clocks, vec![3, 4]);
        for entry in &export.entries {
            let content = entry.content.as_ref().unwrap();
            assert_eq!(Digest::new(content), entry.entry.digest);
        }
    }
}
