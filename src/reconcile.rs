//! The reconciliation engine.
//!
//! Runs only on the worker holding the leader token. On every sweep it walks
//! the users this node is primary for and compares digest summaries with
//! each secondary, starting from the cached last-synced clock. A lagging
//! secondary with a clean shared prefix gets a sync job for the missing
//! range; a secondary whose shared prefix differs is binary-searched for the
//! first divergent clock and flagged for operator attention, since forward
//! sync cannot repair conflicting entries. An unreachable secondary gets a
//! sync job anyway, whose retry schedule provides the backoff.
//!
//! The cache only ever advances on verified evidence: an equal summary over
//! the probed range, or a completion report for a finished job.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result;
use iroh_metrics::inc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    config::SyncConfig,
    coordinator::{Coordinator, LeaderGrant},
    digest::Summary,
    metrics::Metrics,
    replica_set::ReplicaSet,
    sched::{JobOutcome, Scheduler, SyncJob},
    store::{Store, UserId},
    sync::{transfer::SyncClient, DigestResponse},
};

const COMPLETIONS_CAPACITY: usize = 64;

/// Replica pairs that forward sync cannot repair, shared with the health
/// surface.
#[derive(Debug, Clone, Default)]
pub struct DivergenceSet(Arc<Mutex<BTreeSet<(UserId, Url)>>>);

impl DivergenceSet {
    /// Flag a pair. Returns true when it was not flagged before.
    fn mark(&self, user_id: UserId, target: &Url) -> bool {
        self.0.lock().insert((user_id, target.clone()))
    }

    fn clear(&self, user_id: UserId, target: &Url) {
        self.0.lock().remove(&(user_id, target.clone()));
    }

    /// Number of distinct users with at least one diverged replica.
    pub fn user_count(&self) -> usize {
        let set = self.0.lock();
        let mut count = 0;
        let mut prev = None;
        for (user_id, _) in set.iter() {
            if prev != Some(*user_id) {
                count += 1;
                prev = Some(*user_id);
            }
        }
        count
    }
}

/// Per-epoch sweep state. Lives and dies with the leader token.
#[derive(Debug, Default)]
struct SweepState {
    /// Sweep counter, drives the round-robin user slicing.
    sweep: u64,
    /// Highest clock verified as synced, per (user, target).
    last_synced: HashMap<(UserId, Url), u64>,
    /// Consecutive failed jobs per (user, target), reset on success.
    failures: HashMap<(UserId, Url), u32>,
}

/// The reconciliation loop and its dependencies.
///
/// Cheaply cloneable so every worker can hold one; only the one receiving a
/// leadership grant runs it.
#[derive(Debug, Clone)]
pub(crate) struct Reconciler {
    store: Store,
    client: SyncClient,
    scheduler: Scheduler,
    coordinator: Coordinator,
    me: Url,
    config: SyncConfig,
    diverged: DivergenceSet,
}

impl Reconciler {
    pub(crate) fn new(
        store: Store,
        client: SyncClient,
        scheduler: Scheduler,
        coordinator: Coordinator,
        me: Url,
        config: SyncConfig,
        diverged: DivergenceSet,
    ) -> Self {
        Self {
            store,
            client,
            scheduler,
            coordinator,
            me,
            config,
            diverged,
        }
    }

    /// Run the sweep loop under a leadership grant until the epoch ends.
    pub(crate) async fn run(self, grant: LeaderGrant) {
        let LeaderGrant { token, cancelled } = grant;
        let (completions_tx, mut completions) = mpsc::channel(COMPLETIONS_CAPACITY);
        match self
            .coordinator
            .register_completions(&token, completions_tx)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(epoch = token.epoch(), "epoch over before reconciliation started");
                return;
            }
            Err(err) => {
                debug!(%err, "coordinator is gone, not starting reconciliation");
                return;
            }
        }
        info!(worker = %token.worker(), epoch = token.epoch(), "reconciliation loop running");

        let mut state = SweepState::default();
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                Some(outcome) = completions.recv() => self.on_completion(&mut state, outcome),
                _ = interval.tick() => self.sweep(&mut state, &cancelled).await,
            }
        }
        info!(epoch = token.epoch(), "reconciliation loop stopped");
    }

    async fn sweep(&self, state: &mut SweepState, cancelled: &CancellationToken) {
        state.sweep += 1;
        inc!(Metrics, sweeps);
        let modulo = self.config.sweep_modulo.max(1);
        let slice = state.sweep % modulo;
        let assignments = match self.store.primary_assignments(&self.me) {
            Ok(assignments) => assignments,
            Err(err) => {
                warn!(err = format!("{err:#}"), "failed to list primary assignments, skipping sweep");
                return;
            }
        };
        trace!(sweep = state.sweep, users = assignments.len(), "reconciliation sweep");
        for rs in assignments {
            if rs.user_id.0 % modulo != slice {
                continue;
            }
            for target in &rs.secondaries {
                if cancelled.is_cancelled() {
                    return;
                }
                if let Err(err) = self.reconcile_pair(state, &rs, target).await {
                    warn!(
                        user = %rs.user_id,
                        target = %target,
                        err = format!("{err:#}"),
                        "reconciliation failed"
                    );
                }
            }
        }
    }

    /// Compare one (user, secondary) pair and queue repair work.
    async fn reconcile_pair(
        &self,
        state: &mut SweepState,
        rs: &ReplicaSet,
        target: &Url,
    ) -> Result<()> {
        let user_id = rs.user_id;
        let key = (user_id, target.clone());
        let local_clock = self.store.current_clock(user_id)?;
        let mut last = state
            .last_synced
            .get(&key)
            .copied()
            .unwrap_or(0)
            .min(local_clock);

        let Some(mut remote) = self.probe(target, user_id, last, local_clock).await? else {
            // can't compare; the job's retry schedule provides the backoff
            if local_clock > last {
                self.enqueue(rs, target, last, local_clock).await;
            }
            return Ok(());
        };

        if remote.clock < last {
            // the target lost state since we last synced, compare from scratch
            debug!(user = %user_id, target = %target, clock = remote.clock, last, "target is behind the cache");
            last = 0;
            state.last_synced.insert(key.clone(), 0);
            remote = match self.probe(target, user_id, 0, local_clock).await? {
                Some(remote) => remote,
                None => return Ok(()),
            };
        }

        let Some(remote_summary) = remote.summary else {
            // the target has never seen this user
            if local_clock > 0 {
                debug!(user = %user_id, target = %target, "target has no log, syncing from clock 0");
                state.last_synced.insert(key, 0);
                self.enqueue(rs, target, 0, local_clock).await;
            }
            return Ok(());
        };

        if remote.clock >= local_clock {
            let local_summary = self.summary_or_empty(user_id, last, local_clock)?;
            if remote_summary == local_summary {
                if remote.clock == local_clock {
                    trace!(user = %user_id, target = %target, clock = local_clock, "in sync");
                    if last < local_clock {
                        state.last_synced.insert(key.clone(), local_clock);
                    }
                    state.failures.remove(&key);
                    self.diverged.clear(user_id, target);
                } else {
                    // clean shared prefix but the secondary holds more
                    self.mark_diverged(user_id, target, "target is ahead of the primary");
                }
                return Ok(());
            }
            // conflicting entries somewhere in (last, local_clock]
            if let Some(d) = self
                .find_divergence(target, user_id, last, local_clock)
                .await?
            {
                self.mark_diverged(
                    user_id,
                    target,
                    &format!("entries differ at clock {d}, forward sync cannot repair"),
                );
            }
            return Ok(());
        }

        // The target lags. Its probed summary only covers entries it has, so
        // it doubles as its summary over the shared range (last, remote.clock].
        let prefix = self.summary_or_empty(user_id, last, remote.clock)?;
        if prefix == remote_summary {
            if last < remote.clock {
                state.last_synced.insert(key.clone(), remote.clock);
            }
            self.enqueue(rs, target, remote.clock, local_clock).await;
            return Ok(());
        }
        if let Some(d) = self
            .find_divergence(target, user_id, last, remote.clock)
            .await?
        {
            self.mark_diverged(
                user_id,
                target,
                &format!("entries differ at clock {d}, forward sync cannot repair"),
            );
        }
        Ok(())
    }

    /// Find the first clock in `(low, high]` where the target's entries
    /// differ from ours, by halving summary probes.
    ///
    /// Precondition: the summaries over `(low, high]` differ. Returns `None`
    /// when a probe fails; the next sweep retries.
    async fn find_divergence(
        &self,
        target: &Url,
        user_id: UserId,
        mut low: u64,
        mut high: u64,
    ) -> Result<Option<u64>> {
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            let Some(remote) = self.probe(target, user_id, low, mid).await? else {
                return Ok(None);
            };
            let local = self.summary_or_empty(user_id, low, mid)?;
            let remote_summary = remote.summary.unwrap_or(Summary::EMPTY);
            if remote_summary == local {
                low = mid;
            } else {
                high = mid;
            }
        }
        Ok(Some(high))
    }

    /// Probe the target's digest endpoint. `None` means unreachable, which
    /// is never an error here.
    async fn probe(
        &self,
        target: &Url,
        user_id: UserId,
        low: u64,
        high: u64,
    ) -> Result<Option<DigestResponse>> {
        match self.client.digest(target, user_id, low, high).await {
            Ok(remote) => Ok(Some(remote)),
            Err(err) if err.is_retryable() => {
                debug!(user = %user_id, target = %target, %err, "digest probe failed");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn summary_or_empty(&self, user_id: UserId, low: u64, high: u64) -> Result<Summary> {
        Ok(self
            .store
            .summary(user_id, low, high)?
            .unwrap_or(Summary::EMPTY))
    }

    async fn enqueue(&self, rs: &ReplicaSet, target: &Url, low: u64, high: u64) {
        let job = SyncJob {
            user_id: rs.user_id,
            target: target.clone(),
            low,
            high,
            blocknumber: rs.blocknumber,
        };
        match self.scheduler.enqueue(job).await {
            Ok(outcome) => {
                trace!(user = %rs.user_id, target = %target, low, high, %outcome, "sync job")
            }
            Err(err) => debug!(%err, "scheduler is gone, dropping sync job"),
        }
    }

    fn mark_diverged(&self, user_id: UserId, target: &Url, reason: &str) {
        if self.diverged.mark(user_id, target) {
            warn!(user = %user_id, target = %target, reason, "replica diverged, operator attention required");
            inc!(Metrics, divergences);
        }
    }

    /// Fold a terminal job outcome into the sweep state.
    fn on_completion(&self, state: &mut SweepState, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded { job, attempts } => {
                trace!(user = %job.user_id, target = %job.target, high = job.high, attempts, "sync confirmed");
                self.diverged.clear(job.user_id, &job.target);
                let key = (job.user_id, job.target);
                state.failures.remove(&key);
                let last = state.last_synced.entry(key).or_insert(0);
                *last = (*last).max(job.high);
            }
            JobOutcome::Failed {
                job,
                attempts,
                last_error,
            } => {
                let key = (job.user_id, job.target);
                let failures = state.failures.entry(key).or_insert(0);
                *failures += 1;
                debug!(
                    user = %job.user_id,
                    attempts,
                    consecutive = *failures,
                    last_error,
                    "sync job failed"
                );
            }
            JobOutcome::Cancelled { job } => {
                // the pair may no longer exist, forget everything about it
                self.diverged.clear(job.user_id, &job.target);
                let key = (job.user_id, job.target);
                state.last_synced.remove(&key);
                state.failures.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        digest::Digest,
        sched::WorkItem,
        server::Server,
        store::{LogEntry, PutContent, StoreOptions},
        sync::{export_entries, ApplyBatch, SyncEntry},
    };

    const WALLET: &str = "0xw";

    fn outcome_job(user: u64, target: &str, high: u64) -> SyncJob {
        SyncJob {
            user_id: UserId(user),
            target: target.parse().unwrap(),
            low: 0,
            high,
            blocknumber: 1,
        }
    }

    struct Harness {
        reconciler: Reconciler,
        scheduler: Scheduler,
        diverged: DivergenceSet,
        /// Kept open so enqueued jobs dispatch and count as running.
        _work_rx: flume::Receiver<WorkItem>,
        _shutdown: CancellationToken,
    }

    fn harness(store: Store) -> Harness {
        let config = SyncConfig::default();
        let client = SyncClient::new(&config, None).unwrap();
        let shutdown = CancellationToken::new();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (scheduler, work_rx) = Scheduler::spawn(&config, events_tx, shutdown.clone());
        let coordinator = Coordinator::spawn(shutdown.clone());
        let diverged = DivergenceSet::default();
        let reconciler = Reconciler::new(
            store,
            client,
            scheduler.clone(),
            coordinator,
            "http://me.example".parse().unwrap(),
            config,
            diverged.clone(),
        );
        Harness {
            reconciler,
            scheduler,
            diverged,
            _work_rx: work_rx,
            _shutdown: shutdown,
        }
    }

    async fn put(store: &Store, user: u64, body: &str) {
        store
            .put_content(PutContent {
                user_id: UserId(user),
                wallet: WALLET.to_string(),
                entity_id: None,
                gated: false,
                bytes: Bytes::copy_from_slice(body.as_bytes()),
            })
            .await
            .unwrap();
    }

    fn conflict_entry(clock: u64, body: &str) -> SyncEntry {
        let content = Bytes::copy_from_slice(body.as_bytes());
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

    fn assignment(me: &Url, target: &Url) -> ReplicaSet {
        ReplicaSet {
            user_id: UserId(1),
            wallet: WALLET.to_string(),
            primary: me.clone(),
            secondaries: vec![target.clone()],
            blocknumber: 1,
        }
    }

    #[tokio::test]
    async fn narrowing_finds_the_first_divergent_clock() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=10 {
            put(&store, 1, &format!("track-{i}")).await;
        }

        // the target shares clocks 1..=5 and diverges at 6
        let client = SyncClient::new(&SyncConfig::default(), None).unwrap();
        let export = export_entries(&store, UserId(1), 0, 5, 100)
            .await
            .unwrap()
            .unwrap();
        let shared = ApplyBatch {
            user_id: UserId(1),
            wallet: export.wallet,
            entries: export.entries,
        };
        client.apply(&remote_url, &shared).await.unwrap();
        let conflicts = ApplyBatch {
            user_id: UserId(1),
            wallet: WALLET.to_string(),
            entries: (6..=10).map(|i| conflict_entry(i, &format!("other-{i}"))).collect(),
        };
        client.apply(&remote_url, &conflicts).await.unwrap();

        let h = harness(store);
        let divergence = h
            .reconciler
            .find_divergence(&remote_url, UserId(1), 0, 10)
            .await
            .unwrap();
        assert_eq!(divergence, Some(6));

        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_prefix_flags_the_pair_without_a_job() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=10 {
            put(&store, 1, &format!("track-{i}")).await;
        }

        // the lagging target holds a rewritten history for clocks 1..=5
        let client = SyncClient::new(&SyncConfig::default(), None).unwrap();
        let rewritten = ApplyBatch {
            user_id: UserId(1),
            wallet: WALLET.to_string(),
            entries: (1..=5).map(|i| conflict_entry(i, &format!("other-{i}"))).collect(),
        };
        client.apply(&remote_url, &rewritten).await.unwrap();

        let h = harness(store);
        let me: Url = "http://me.example".parse().unwrap();
        let mut state = SweepState::default();
        h.reconciler
            .reconcile_pair(&mut state, &assignment(&me, &remote_url), &remote_url)
            .await
            .unwrap();

        // flagged for an operator; syncing forward would not converge
        assert_eq!(h.diverged.user_count(), 1);
        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.retries_pending, 0);
        // the cache never advances over conflicting entries
        assert!(state
            .last_synced
            .get(&(UserId(1), remote_url.clone()))
            .is_none());

        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fresh_target_resets_a_stale_cache() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=10 {
            put(&store, 1, &format!("track-{i}")).await;
        }

        let h = harness(store);
        let me: Url = "http://me.example".parse().unwrap();
        // the cache says clock 10, but the target lost its data since
        let key = (UserId(1), remote_url.clone());
        let mut state = SweepState::default();
        state.last_synced.insert(key.clone(), 10);
        h.reconciler
            .reconcile_pair(&mut state, &assignment(&me, &remote_url), &remote_url)
            .await
            .unwrap();

        // cache reset, a full re-sync dispatched, no divergence
        assert_eq!(state.last_synced.get(&key), Some(&0));
        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.running, 1);
        assert_eq!(h.diverged.user_count(), 0);

        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_target_still_gets_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=10 {
            put(&store, 1, &format!("track-{i}")).await;
        }

        let h = harness(store);
        let me: Url = "http://me.example".parse().unwrap();
        // nothing listens on port 1, so the pair cannot be compared
        let dead: Url = "http://127.0.0.1:1".parse().unwrap();
        let mut state = SweepState::default();
        h.reconciler
            .reconcile_pair(&mut state, &assignment(&me, &dead), &dead)
            .await
            .unwrap();

        // sync is attempted anyway; the job's own retries provide the backoff
        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.running, 1);
        assert_eq!(h.diverged.user_count(), 0);
        assert!(state.last_synced.get(&(UserId(1), dead.clone())).is_none());
    }

    #[tokio::test]
    async fn target_ahead_of_the_primary_is_flagged() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=5 {
            put(&store, 1, &format!("track-{i}")).await;
        }

        // the target shares our five entries but holds five more
        let client = SyncClient::new(&SyncConfig::default(), None).unwrap();
        let export = export_entries(&store, UserId(1), 0, 5, 100)
            .await
            .unwrap()
            .unwrap();
        let shared = ApplyBatch {
            user_id: UserId(1),
            wallet: export.wallet,
            entries: export.entries,
        };
        client.apply(&remote_url, &shared).await.unwrap();
        let extra = ApplyBatch {
            user_id: UserId(1),
            wallet: WALLET.to_string(),
            entries: (6..=10).map(|i| conflict_entry(i, &format!("extra-{i}"))).collect(),
        };
        client.apply(&remote_url, &extra).await.unwrap();

        let h = harness(store);
        let me: Url = "http://me.example".parse().unwrap();
        let mut state = SweepState::default();
        h.reconciler
            .reconcile_pair(&mut state, &assignment(&me, &remote_url), &remote_url)
            .await
            .unwrap();

        // forward sync cannot shorten a log; an operator has to decide
        assert_eq!(h.diverged.user_count(), 1);
        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);

        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn completion_reports_drive_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        let reconciler = harness(store).reconciler;
        let mut state = SweepState::default();
        let key = (UserId(1), "http://a".parse::<Url>().unwrap());

        reconciler.on_completion(
            &mut state,
            JobOutcome::Succeeded {
                job: outcome_job(1, "http://a", 10),
                attempts: 1,
            },
        );
        assert_eq!(state.last_synced.get(&key), Some(&10));

        // a stale success never moves the cache backwards
        reconciler.on_completion(
            &mut state,
            JobOutcome::Succeeded {
                job: outcome_job(1, "http://a", 7),
                attempts: 1,
            },
        );
        assert_eq!(state.last_synced.get(&key), Some(&10));

        reconciler.on_completion(
            &mut state,
            JobOutcome::Failed {
                job: outcome_job(1, "http://a", 12),
                attempts: 3,
                last_error: "unreachable".to_string(),
            },
        );
        assert_eq!(state.failures.get(&key), Some(&1));
        assert_eq!(state.last_synced.get(&key), Some(&10));

        // cancellation drops all pair state
        reconciler.on_completion(
            &mut state,
            JobOutcome::Cancelled {
                job: outcome_job(1, "http://a", 12),
            },
        );
        assert!(state.last_synced.get(&key).is_none());
        assert!(state.failures.get(&key).is_none());
    }

    #[test]
    fn diverged_users_are_counted_once() {
        let set = DivergenceSet::default();
        let a: Url = "http://a".parse().unwrap();
        let b: Url = "http://b".parse().unwrap();
        assert_eq!(set.user_count(), 0);
        assert!(set.mark(UserId(1), &a));
        assert!(set.mark(UserId(1), &b));
        // flagging the same pair twice is not a new divergence
        assert!(!set.mark(UserId(1), &b));
        assert!(set.mark(UserId(2), &a));
        assert_eq!(set.user_count(), 2);
        set.clear(UserId(1), &a);
        assert_eq!(set.user_count(), 2);
        set.clear(UserId(1), &b);
        assert_eq!(set.user_count(), 1);
    }
}
