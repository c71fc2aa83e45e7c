//! Persistent node state: user records, the clock log, the digest index, the
//! stored replica sets and the blob files.
//!
//! The index lives in a single redb database, blob bytes live next to it in a
//! sharded flat directory (see [`blobs`]). A content write stores the blob
//! first and then appends the log entry, the digest-index entry and the user
//! clock bump in one write transaction. A crash in between leaves only an
//! unreferenced blob, so the operation is recoverable by re-running it.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use iroh_metrics::{inc, inc_by};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::{
    digest::{Digest, Summary},
    metrics::Metrics,
    replica_set::ReplicaSet,
};

mod blobs;
mod tables;

use self::blobs::BlobStore;
use self::tables::{Tables, BY_DIGEST_TABLE, LOG_TABLE, REPLICA_SETS_TABLE, USERS_TABLE};

/// User identifier assigned by the upstream registry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Stored once per user hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The user's wallet.
    pub wallet: String,
    /// Clock value of the latest accepted write. Starts at 0.
    pub clock: u64,
    /// The storage provider id this node serves the user under.
    pub sp_id: u32,
    /// Whether this node instance acts as an operator node for the user.
    pub operator_node: bool,
    /// Soft mark set when the user is reassigned away from this node.
    /// Data is kept, but the user is excluded from reconciliation.
    pub unassigned: bool,
}

/// Stored once per clock log entry. The clock itself is the table key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Digest of the content bytes.
    pub digest: Digest,
    /// The track or other entity this content belongs to, if any.
    pub entity_id: Option<u64>,
    /// Size of the content in bytes.
    pub size: u64,
    /// Content intentionally not stored, e.g. oversized.
    pub skipped: bool,
    /// Fetching the bytes requires node-to-node authorization.
    pub gated: bool,
}

/// A clock log entry as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position of this entry in the owner's clock log.
    pub clock: u64,
    /// Digest of the content bytes.
    pub digest: Digest,
    /// The track or other entity this content belongs to, if any.
    pub entity_id: Option<u64>,
    /// Size of the content in bytes.
    pub size: u64,
    /// Content intentionally not stored, e.g. oversized.
    pub skipped: bool,
    /// Fetching the bytes requires node-to-node authorization.
    pub gated: bool,
}

impl LogEntry {
    fn new(clock: u64, record: LogRecord) -> Self {
        Self {
            clock,
            digest: record.digest,
            entity_id: record.entity_id,
            size: record.size,
            skipped: record.skipped,
            gated: record.gated,
        }
    }

    fn record(&self) -> LogRecord {
        LogRecord {
            digest: self.digest,
            entity_id: self.entity_id,
            size: self.size,
            skipped: self.skipped,
            gated: self.gated,
        }
    }
}

/// A content write request, as accepted from the upload pipeline.
#[derive(Debug, Clone)]
pub struct PutContent {
    /// The owning user.
    pub user_id: UserId,
    /// The owner's wallet. Must match the stored record for known users.
    pub wallet: String,
    /// The track or other entity this content belongs to, if any.
    pub entity_id: Option<u64>,
    /// Whether fetching the bytes requires node-to-node authorization.
    pub gated: bool,
    /// The content bytes.
    pub bytes: Bytes,
}

/// The outcome of a content write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PutOutcome {
    /// Digest of the written bytes.
    pub digest: Digest,
    /// The clock value assigned to the write.
    pub clock: u64,
    /// Whether the bytes were skipped because they exceed the size limit.
    pub skipped: bool,
}

/// Metadata for stored content, resolved through the digest index.
#[derive(Debug, Clone, Copy)]
pub struct ContentMeta {
    /// The user owning the first log entry referencing this digest.
    pub user_id: UserId,
    /// The clock of that entry.
    pub clock: u64,
    /// Size of the content in bytes.
    pub size: u64,
    /// Whether the bytes were never stored.
    pub skipped: bool,
    /// Whether fetching requires node-to-node authorization.
    pub gated: bool,
}

/// The outcome of ingesting a replica-set record.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaSetOutcome {
    /// False when the record was stale and ignored.
    pub accepted: bool,
    /// Whether this node was a member before the update.
    pub was_member: bool,
    /// Whether this node is a member after the update.
    pub is_member: bool,
}

/// Options for opening a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Payloads larger than this are recorded as skipped and not stored.
    pub max_file_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_file_size: 250_000_000,
        }
    }
}

/// The persistent store. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    db: Database,
    blobs: BlobStore,
    options: StoreOptions,
    /// Per-user write locks serializing clock assignment.
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    /// Open or create the store under the given directory.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        info!("opening store at {}", dir.to_string_lossy());
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory at {dir:?}"))?;
        let db = Database::builder()
            .create(dir.join("holdfast-1.db"))
            .context("failed to open index database")?;
        let write_tx = db.begin_write()?;
        {
            let _tables = Tables::new(&write_tx)?;
        }
        write_tx.commit()?;
        let blobs = BlobStore::open(dir.join("blobs"))?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                blobs,
                options,
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The write lock for a user.
    ///
    /// Everything that assigns a clock value for the user must run under this
    /// lock. Writes for different users proceed in parallel.
    pub(crate) fn user_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.locks.lock();
        locks.entry(user_id).or_default().clone()
    }

    /// The blob files.
    pub(crate) fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    /// Ingest a local content write.
    ///
    /// Stores the blob, assigns the next clock value and appends the log
    /// entry, all under the user's write lock. Oversized payloads are recorded
    /// with the `skipped` flag and their bytes are dropped.
    pub async fn put_content(&self, put: PutContent) -> Result<PutOutcome> {
        let lock = self.user_lock(put.user_id);
        let _guard = lock.lock().await;

        let digest = Digest::new(&put.bytes);
        let size = put.bytes.len() as u64;
        let skipped = size > self.inner.options.max_file_size;
        if !skipped {
            self.inner.blobs.put(&digest, &put.bytes).await?;
        }

        let record = LogRecord {
            digest,
            entity_id: put.entity_id,
            size,
            skipped,
            gated: put.gated,
        };
        let clock = self.append(put.user_id, &put.wallet, None, &record)?;

        inc!(Metrics, content_puts);
        inc_by!(Metrics, content_put_bytes, size);
        Ok(PutOutcome {
            digest,
            clock,
            skipped,
        })
    }

    /// Append an entry received from another replica.
    ///
    /// The caller must hold the user's write lock, must have verified the
    /// content bytes against the digest and must have stored the blob already.
    /// The entry's clock must be exactly one above the user's current clock.
    pub(crate) fn apply_entry(&self, user_id: UserId, wallet: &str, entry: &LogEntry) -> Result<()> {
        self.append(user_id, wallet, Some(entry.clock), &entry.record())?;
        inc!(Metrics, entries_applied);
        Ok(())
    }

    /// Append one log entry and bump the user clock in a single transaction.
    ///
    /// With `expected_clock` set, the append fails unless it lands exactly
    /// there; otherwise the next free clock value is assigned. Returns the
    /// clock value of the new entry.
    fn append(
        &self,
        user_id: UserId,
        wallet: &str,
        expected_clock: Option<u64>,
        record: &LogRecord,
    ) -> Result<u64> {
        let tx = self.inner.db.begin_write()?;
        let clock = {
            let mut tables = Tables::new(&tx)?;
            let mut user = match get_user(&tables.users, user_id)? {
                Some(user) => {
                    if user.wallet != wallet {
                        bail!("wallet mismatch for user {user_id}");
                    }
                    user
                }
                None => UserRecord {
                    wallet: wallet.to_string(),
                    clock: 0,
                    sp_id: 0,
                    operator_node: false,
                    unassigned: false,
                },
            };
            let clock = user.clock + 1;
            if let Some(expected) = expected_clock {
                if expected != clock {
                    bail!(
                        "clock log gap for user {user_id}: expected to append {clock}, got {expected}"
                    );
                }
            }
            user.clock = clock;
            let user_bytes = postcard::to_stdvec(&user)?;
            tables.users.insert(user_id.0, user_bytes.as_slice())?;
            let record_bytes = postcard::to_stdvec(record)?;
            tables.log.insert((user_id.0, clock), record_bytes.as_slice())?;
            tables
                .by_digest
                .insert((record.digest.as_bytes(), user_id.0, clock), ())?;
            clock
        };
        tx.commit()?;
        Ok(clock)
    }

    /// Retrieve content bytes by digest.
    pub async fn get_content(&self, digest: &Digest) -> Result<Option<Bytes>> {
        self.inner.blobs.get(digest).await
    }

    /// Look up metadata for a digest through the digest index.
    ///
    /// Returns the first referencing log entry. Unreferenced blobs resolve to
    /// `None` and are never served.
    pub fn content_meta(&self, digest: &Digest) -> Result<Option<ContentMeta>> {
        let tx = self.inner.db.begin_read()?;
        let by_digest = tx.open_table(BY_DIGEST_TABLE)?;
        let log = tx.open_table(LOG_TABLE)?;
        let start = (digest.as_bytes(), 0u64, 0u64);
        let end = (digest.as_bytes(), u64::MAX, u64::MAX);
        let Some(row) = by_digest.range(start..=end)?.next() else {
            return Ok(None);
        };
        let (key, _) = row?;
        let (_, user_id, clock) = key.value();
        let Some(row) = log.get((user_id, clock))? else {
            bail!("digest index references missing log entry ({user_id}, {clock})");
        };
        let record: LogRecord = postcard::from_bytes(row.value())?;
        Ok(Some(ContentMeta {
            user_id: UserId(user_id),
            clock,
            size: record.size,
            skipped: record.skipped,
            gated: record.gated,
        }))
    }

    /// Get the stored record for a user.
    pub fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let tx = self.inner.db.begin_read()?;
        let users = tx.open_table(USERS_TABLE)?;
        get_user(&users, user_id)
    }

    /// The user's current clock value. 0 for unknown users.
    pub fn current_clock(&self, user_id: UserId) -> Result<u64> {
        Ok(self.get_user(user_id)?.map(|u| u.clock).unwrap_or(0))
    }

    /// The order-independent summary over the user's entries in `(low, high]`.
    ///
    /// Returns `None` when the user has no log at all, which callers must
    /// treat differently from the summary of an empty range.
    pub fn summary(&self, user_id: UserId, low: u64, high: u64) -> Result<Option<Summary>> {
        let tx = self.inner.db.begin_read()?;
        let users = tx.open_table(USERS_TABLE)?;
        if get_user(&users, user_id)?.is_none() {
            return Ok(None);
        }
        let log = tx.open_table(LOG_TABLE)?;
        let mut summary = Summary::EMPTY;
        if high > low {
            for row in log.range((user_id.0, low + 1)..=(user_id.0, high))? {
                let (key, value) = row?;
                let (_, clock) = key.value();
                let record: LogRecord = postcard::from_bytes(value.value())?;
                summary.insert(&record.digest, clock);
            }
        }
        Ok(Some(summary))
    }

    /// The user's entries in `(low, high]` in ascending clock order, at most
    /// `limit` of them.
    pub fn entries_in_range(
        &self,
        user_id: UserId,
        low: u64,
        high: u64,
        limit: u64,
    ) -> Result<Vec<LogEntry>> {
        let tx = self.inner.db.begin_read()?;
        let log = tx.open_table(LOG_TABLE)?;
        let mut entries = Vec::new();
        if high > low {
            for row in log.range((user_id.0, low + 1)..=(user_id.0, high))? {
                if entries.len() as u64 >= limit {
                    break;
                }
                let (key, value) = row?;
                let (_, clock) = key.value();
                let record: LogRecord = postcard::from_bytes(value.value())?;
                entries.push(LogEntry::new(clock, record));
            }
        }
        Ok(entries)
    }

    /// Ingest a replica-set record from the membership feed.
    ///
    /// Only records with a blocknumber strictly above the stored one are
    /// accepted. When this node loses membership, the user record is
    /// soft-marked as unassigned; content is kept.
    pub fn apply_replica_set(&self, rs: &ReplicaSet, me: &Url) -> Result<ReplicaSetOutcome> {
        let tx = self.inner.db.begin_write()?;
        let outcome = {
            let mut tables = Tables::new(&tx)?;
            let current = match tables.replica_sets.get(rs.user_id.0)? {
                Some(row) => Some(postcard::from_bytes::<ReplicaSet>(row.value())?),
                None => None,
            };
            let was_member = current.as_ref().map(|c| c.is_member(me)).unwrap_or(false);
            let accepted = match &current {
                Some(current) => current.superseded_by(rs),
                None => true,
            };
            if !accepted {
                ReplicaSetOutcome {
                    accepted,
                    was_member,
                    is_member: was_member,
                }
            } else {
                let rs_bytes = postcard::to_stdvec(rs)?;
                tables.replica_sets.insert(rs.user_id.0, rs_bytes.as_slice())?;
                let is_member = rs.is_member(me);
                if let Some(mut user) = get_user(&tables.users, rs.user_id)? {
                    user.unassigned = !is_member;
                    let user_bytes = postcard::to_stdvec(&user)?;
                    tables.users.insert(rs.user_id.0, user_bytes.as_slice())?;
                }
                ReplicaSetOutcome {
                    accepted,
                    was_member,
                    is_member,
                }
            }
        };
        tx.commit()?;
        if outcome.accepted {
            inc!(Metrics, replica_sets_accepted);
        } else {
            inc!(Metrics, replica_sets_stale);
        }
        Ok(outcome)
    }

    /// The stored replica set for a user.
    pub fn replica_set(&self, user_id: UserId) -> Result<Option<ReplicaSet>> {
        let tx = self.inner.db.begin_read()?;
        let table = tx.open_table(REPLICA_SETS_TABLE)?;
        let Some(row) = table.get(user_id.0)? else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(row.value())?))
    }

    /// All users whose stored replica set names `me` as primary.
    pub fn primary_assignments(&self, me: &Url) -> Result<Vec<ReplicaSet>> {
        let tx = self.inner.db.begin_read()?;
        let table = tx.open_table(REPLICA_SETS_TABLE)?;
        let mut assignments = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            let rs: ReplicaSet = postcard::from_bytes(value.value())?;
            if rs.is_primary(me) {
                assignments.push(rs);
            }
        }
        Ok(assignments)
    }

    /// Number of users with a record on this node.
    pub fn num_users(&self) -> Result<u64> {
        let tx = self.inner.db.begin_read()?;
        let users = tx.open_table(USERS_TABLE)?;
        Ok(users.len()?)
    }

    /// Current blob disk usage in bytes.
    pub fn disk_usage(&self) -> u64 {
        self.inner.blobs.disk_usage()
    }

    /// The configured skip threshold.
    pub fn max_file_size(&self) -> u64 {
        self.inner.options.max_file_size
    }
}

fn get_user(
    table: &impl ReadableTable<u64, &'static [u8]>,
    user_id: UserId,
) -> Result<Option<UserRecord>> {
    let Some(row) = table.get(user_id.0)? else {
        return Ok(None);
    };
    Ok(Some(postcard::from_bytes(row.value())?))
}
