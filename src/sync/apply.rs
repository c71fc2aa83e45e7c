//! The receiving side of replica synchronization.
//!
//! Entries apply strictly in ascending clock order per user. An entry whose
//! clock is at or below the receiver's is a replay and skipped, one exactly
//! one above is verified and written, and anything further ahead is parked in
//! a bounded per-user gap buffer until the missing clocks arrive. When a
//! buffer overflows or outlives its age limit it is dropped wholesale; the
//! sender's next reconciliation run re-delivers the range.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use iroh_metrics::inc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::SyncConfig,
    digest::Digest,
    metrics::Metrics,
    store::{Store, UserId},
};

use super::{ApplyBatch, ApplyResponse, SyncEntry};

/// Errors that reject an apply batch.
///
/// A rejected batch keeps its already-applied prefix; entries are durable the
/// moment they are written.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The content bytes do not hash to the digest the entry claims.
    #[error("content at clock {clock} does not match its digest: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Clock of the offending entry.
        clock: u64,
        /// The digest the entry claims.
        expected: Digest,
        /// The digest of the bytes that arrived.
        actual: Digest,
    },
    /// A non-skipped entry arrived without content bytes.
    #[error("entry at clock {clock} is not skipped but carries no content")]
    MissingContent {
        /// Clock of the offending entry.
        clock: u64,
    },
    /// The batch names a wallet other than the stored owner's.
    #[error("batch wallet {claimed} does not match stored wallet {stored}")]
    WalletMismatch {
        /// The wallet the batch claims.
        claimed: String,
        /// The wallet on the stored user record.
        stored: String,
    },
    /// The store failed while applying.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_entries: usize,
    max_bytes: u64,
    max_age: Duration,
}

/// Out-of-order entries for a single user, keyed by clock.
///
/// Invariant: every buffered entry has been digest-verified at insert time.
#[derive(Debug, Default)]
struct GapBuffer {
    entries: BTreeMap<u64, SyncEntry>,
    bytes: u64,
    since: Option<Instant>,
}

impl GapBuffer {
    fn insert(&mut self, entry: SyncEntry) {
        self.bytes += content_len(&entry);
        self.since.get_or_insert_with(Instant::now);
        if let Some(old) = self.entries.insert(entry.entry.clock, entry) {
            self.bytes -= content_len(&old);
        }
    }

    fn take(&mut self, clock: u64) -> Option<SyncEntry> {
        let entry = self.entries.remove(&clock)?;
        self.bytes -= content_len(&entry);
        Some(entry)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn expired(&self, max_age: Duration) -> bool {
        self.since
            .map(|since| since.elapsed() > max_age)
            .unwrap_or(false)
    }
}

fn content_len(entry: &SyncEntry) -> u64 {
    entry.content.as_ref().map(|c| c.len() as u64).unwrap_or(0)
}

/// Applies entry batches received from other replicas.
///
/// Cheaply cloneable; all clones share the gap buffers.
#[derive(Debug, Clone)]
pub struct Applier {
    store: Store,
    limits: Limits,
    buffers: Arc<Mutex<HashMap<UserId, GapBuffer>>>,
}

impl Applier {
    /// Create an applier over `store` with the configured gap buffer limits.
    pub fn new(store: Store, config: &SyncConfig) -> Self {
        Self {
            store,
            limits: Limits {
                max_entries: config.gap_buffer_max_entries,
                max_bytes: config.gap_buffer_max_bytes,
                max_age: config.gap_buffer_max_age,
            },
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Apply a batch of entries for a single user.
    ///
    /// Runs under the user's write lock, so concurrent batches for the same
    /// user serialize. Returns the clock reached and the number of entries
    /// left in the gap buffer.
    pub async fn apply_batch(&self, batch: ApplyBatch) -> Result<ApplyResponse, ApplyError> {
        let user_id = batch.user_id;
        let lock = self.store.user_lock(user_id);
        let _guard = lock.lock().await;

        self.drop_buffer_if_expired(user_id);

        let user = self.store.get_user(user_id).map_err(ApplyError::Store)?;
        if let Some(user) = &user {
            if user.wallet != batch.wallet {
                inc!(Metrics, entries_rejected);
                return Err(ApplyError::WalletMismatch {
                    claimed: batch.wallet.clone(),
                    stored: user.wallet.clone(),
                });
            }
        }
        let mut clock = user.map(|u| u.clock).unwrap_or(0);
        for entry in batch.entries {
            let entry_clock = entry.entry.clock;
            if entry_clock <= clock {
                // replay of an entry we already hold
                inc!(Metrics, entries_replayed);
                continue;
            }
            verify(&entry)?;
            if entry_clock == clock + 1 {
                self.write(user_id, &batch.wallet, entry).await?;
                clock = entry_clock;
                clock = self.drain(user_id, &batch.wallet, clock).await?;
            } else {
                self.buffer(user_id, entry);
            }
        }

        let buffered = self
            .buffers
            .lock()
            .get(&user_id)
            .map(|b| b.len())
            .unwrap_or(0);
        Ok(ApplyResponse {
            user_id,
            applied_up_to: clock,
            buffered,
        })
    }

    /// Number of entries currently parked in gap buffers, across all users.
    ///
    /// Sweeps out expired buffers first, so a user whose sender never pushes
    /// again does not hold a buffer forever.
    pub fn buffered_entries(&self) -> usize {
        let mut buffers = self.buffers.lock();
        buffers.retain(|user_id, buffer| {
            let expired = buffer.expired(self.limits.max_age);
            if expired {
                warn!(user = %user_id, entries = buffer.len(), "gap buffer expired, dropping");
                inc!(Metrics, gap_buffers_dropped);
            }
            !expired
        });
        buffers.values().map(|b| b.len()).sum()
    }

    /// Verify, store and append a single in-order entry.
    async fn write(
        &self,
        user_id: UserId,
        wallet: &str,
        entry: SyncEntry,
    ) -> Result<(), ApplyError> {
        if let Some(content) = &entry.content {
            self.store
                .blobs()
                .put(&entry.entry.digest, content)
                .await
                .map_err(ApplyError::Store)?;
        }
        self.store
            .apply_entry(user_id, wallet, &entry.entry)
            .map_err(ApplyError::Store)?;
        Ok(())
    }

    /// Apply buffered entries that have become contiguous. Returns the clock
    /// reached.
    async fn drain(&self, user_id: UserId, wallet: &str, mut clock: u64) -> Result<u64, ApplyError> {
        loop {
            let next = {
                let mut buffers = self.buffers.lock();
                let Some(buffer) = buffers.get_mut(&user_id) else {
                    break;
                };
                let next = buffer.take(clock + 1);
                if buffer.len() == 0 {
                    buffers.remove(&user_id);
                }
                next
            };
            match next {
                Some(entry) => {
                    // verified when it entered the buffer
                    self.write(user_id, wallet, entry).await?;
                    clock += 1;
                }
                None => break,
            }
        }
        Ok(clock)
    }

    /// Park an out-of-order entry, dropping the whole buffer when a limit is
    /// hit.
    fn buffer(&self, user_id: UserId, entry: SyncEntry) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(user_id).or_default();
        if buffer.len() >= self.limits.max_entries
            || buffer.bytes + content_len(&entry) > self.limits.max_bytes
        {
            warn!(user = %user_id, entries = buffer.len(), "gap buffer overflow, dropping");
            inc!(Metrics, gap_buffers_dropped);
            buffers.remove(&user_id);
            return;
        }
        debug!(user = %user_id, clock = entry.entry.clock, "buffering out-of-order entry");
        inc!(Metrics, entries_buffered);
        buffer.insert(entry);
    }

    fn drop_buffer_if_expired(&self, user_id: UserId) {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get(&user_id) {
            if buffer.expired(self.limits.max_age) {
                warn!(user = %user_id, entries = buffer.len(), "gap buffer expired, dropping");
                inc!(Metrics, gap_buffers_dropped);
                buffers.remove(&user_id);
            }
        }
    }
}

fn verify(entry: &SyncEntry) -> Result<(), ApplyError> {
    match &entry.content {
        Some(content) => {
            let actual = Digest::new(content);
            if actual != entry.entry.digest {
                inc!(Metrics, entries_rejected);
                return Err(ApplyError::DigestMismatch {
                    clock: entry.entry.clock,
                    expected: entry.entry.digest,
                    actual,
                });
            }
            Ok(())
        }
        None if entry.entry.skipped => Ok(()),
        None => {
            inc!(Metrics, entries_rejected);
            Err(ApplyError::MissingContent {
                clock: entry.entry.clock,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::store::{LogEntry, StoreOptions};

    fn entry(clock: u64, bytes: &[u8]) -> SyncEntry {
        let content = Bytes::copy_from_slice(bytes);
        SyncEntry {
            entry: LogEntry {
                clock,
                digest: Digest::new(&content),
                entity_id: None,
                size: content.len() as u64,
                skipped: false,
                gated: false,
            },
            content: Some(content),
        }
    }

    fn batch(clocks: &[u64]) -> ApplyBatch {
        ApplyBatch {
            user_id: UserId(1),
            wallet: "0xw".to_string(),
            entries: clocks
                .iter()
                .map(|c| entry(*c, format!("content-{c}").as_bytes()))
                .collect(),
        }
    }

    fn applier(config: &SyncConfig) -> (tempfile::TempDir, Applier) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        (dir, Applier::new(store, config))
    }

    #[tokio::test]
    async fn entries_apply_in_order() {
        let (_dir, applier) = applier(&SyncConfig::default());
        let res = applier.apply_batch(batch(&[1, 2, 3])).await.unwrap();
        assert_eq!(res.applied_up_to, 3);
        assert_eq!(res.buffered, 0);
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (_dir, applier) = applier(&SyncConfig::default());
        applier.apply_batch(batch(&[1, 2, 3])).await.unwrap();
        let res = applier.apply_batch(batch(&[1, 2, 3])).await.unwrap();
        assert_eq!(res.applied_up_to, 3);
        let res = applier.apply_batch(batch(&[2, 3, 4])).await.unwrap();
        assert_eq!(res.applied_up_to, 4);
    }

    #[tokio::test]
    async fn ahead_entries_are_buffered_until_the_gap_fills() {
        let (_dir, applier) = applier(&SyncConfig::default());
        applier.apply_batch(batch(&[1, 2, 3, 4, 5])).await.unwrap();

        // clocks 8..=10 arrive while we sit at 5: parked, not applied
        let res = applier.apply_batch(batch(&[8, 9, 10])).await.unwrap();
        assert_eq!(res.applied_up_to, 5);
        assert_eq!(res.buffered, 3);

        // the missing range arrives, the buffer drains behind it
        let res = applier.apply_batch(batch(&[6, 7])).await.unwrap();
        assert_eq!(res.applied_up_to, 10);
        assert_eq!(res.buffered, 0);
    }

    #[tokio::test]
    async fn mismatched_digest_rejects_the_batch() {
        let (_dir, applier) = applier(&SyncConfig::default());
        let mut bad = batch(&[1, 2]);
        bad.entries[1].entry.digest = Digest::new(b"something else");
        let err = applier.apply_batch(bad).await.unwrap_err();
        assert!(matches!(err, ApplyError::DigestMismatch { clock: 2, .. }));
        // the applied prefix stays
        let res = applier.apply_batch(batch(&[1, 2])).await.unwrap();
        assert_eq!(res.applied_up_to, 2);
    }

    #[tokio::test]
    async fn missing_content_rejects_the_entry() {
        let (_dir, applier) = applier(&SyncConfig::default());
        let mut bad = batch(&[1]);
        bad.entries[0].content = None;
        let err = applier.apply_batch(bad).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingContent { clock: 1 }));
    }

    #[tokio::test]
    async fn skipped_entries_apply_without_content() {
        let (_dir, applier) = applier(&SyncConfig::default());
        let mut batch = batch(&[1]);
        batch.entries[0].entry.skipped = true;
        batch.entries[0].content = None;
        let res = applier.apply_batch(batch).await.unwrap();
        assert_eq!(res.applied_up_to, 1);
    }

    #[tokio::test]
    async fn overflowing_buffer_is_dropped() {
        let config = SyncConfig {
            gap_buffer_max_entries: 2,
            ..Default::default()
        };
        let (_dir, applier) = applier(&config);
        let res = applier.apply_batch(batch(&[3, 4, 5])).await.unwrap();
        assert_eq!(res.applied_up_to, 0);
        assert_eq!(res.buffered, 0);
        // nothing left to drain, the lost range has to be re-delivered
        let res = applier.apply_batch(batch(&[1, 2])).await.unwrap();
        assert_eq!(res.applied_up_to, 2);
    }

    #[tokio::test]
    async fn expired_buffer_is_dropped() {
        let config = SyncConfig {
            gap_buffer_max_age: Duration::from_millis(10),
            ..Default::default()
        };
        let (_dir, applier) = applier(&config);
        let res = applier.apply_batch(batch(&[3])).await.unwrap();
        assert_eq!(res.buffered, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let res = applier.apply_batch(batch(&[1])).await.unwrap();
        assert_eq!(res.applied_up_to, 1);
        assert_eq!(res.buffered, 0);
    }

    #[tokio::test]
    async fn buffered_entries_sweeps_expired_buffers() {
        let config = SyncConfig {
            gap_buffer_max_age: Duration::from_millis(10),
            ..Default::default()
        };
        let (_dir, applier) = applier(&config);
        applier.apply_batch(batch(&[3])).await.unwrap();
        assert_eq!(applier.buffered_entries(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the sender never pushes again; counting sweeps the dead buffer out
        assert_eq!(applier.buffered_entries(), 0);
    }

    #[tokio::test]
    async fn wallet_mismatch_rejects_the_batch() {
        let (_dir, applier) = applier(&SyncConfig::default());
        applier.apply_batch(batch(&[1])).await.unwrap();
        let mut bad = batch(&[2]);
        bad.wallet = "0xother".to_string();
        let err = applier.apply_batch(bad).await.unwrap_err();
        assert!(matches!(err, ApplyError::WalletMismatch { .. }));
        // the stored record is untouched, correct batches still apply
        let res = applier.apply_batch(batch(&[2])).await.unwrap();
        assert_eq!(res.applied_up_to, 2);
    }
}
