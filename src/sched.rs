//! The sync job scheduler.
//!
//! Jobs are keyed by `(user, target)`: at any time at most one job per key is
//! queued, backing off for a retry, or running. A second request for the same
//! key merges into the pending job (extending its clock range) or is dropped
//! when one is already running; the next reconciliation sweep picks up
//! whatever the running job does not cover.
//!
//! The service task owns all bookkeeping and hands dispatched jobs to a pool
//! of [`Worker`] tasks over a bounded channel. Failed attempts retry with
//! exponential backoff until the retry budget is spent; replica-set changes
//! cancel every pending and running job created under the older assignment.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use anyhow::anyhow;
use iroh_metrics::inc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::{
    sync::CancellationToken,
    time::delay_queue::{self, DelayQueue},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::{
    config::SyncConfig,
    coordinator::{LeaderGrant, WorkerId},
    metrics::Metrics,
    reconcile::Reconciler,
    store::{Store, UserId},
    sync::transfer::{self, SyncClient, SyncError},
};

/// Messages the service loop handles.
const SERVICE_CHANNEL_CAPACITY: usize = 128;

/// A sync job: push the user's entries in `(low, high]` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    /// The user whose log is synced.
    pub user_id: UserId,
    /// The replica receiving the entries.
    pub target: Url,
    /// Exclusive lower clock bound.
    pub low: u64,
    /// Inclusive upper clock bound.
    pub high: u64,
    /// The replica-set version this job was created under.
    pub blocknumber: u64,
}

/// At most one job is pending per key.
pub(crate) type JobKey = (UserId, Url);

impl SyncJob {
    pub(crate) fn key(&self) -> JobKey {
        (self.user_id, self.target.clone())
    }
}

/// What happened to an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum EnqueueOutcome {
    /// Accepted as a new queued job.
    Enqueued,
    /// Merged into the pending job for the same user and target.
    Merged,
    /// Dropped, a job for the same user and target is already running.
    Dropped,
    /// Dropped, the queue is at capacity.
    QueueFull,
}

/// Terminal state of a sync job, reported to the coordinator.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The target confirmed the job's full range.
    Succeeded {
        /// The finished job.
        job: SyncJob,
        /// Attempts it took, including the successful one.
        attempts: usize,
    },
    /// The job failed and will not be retried.
    Failed {
        /// The failed job.
        job: SyncJob,
        /// Attempts made before giving up.
        attempts: usize,
        /// The error of the last attempt.
        last_error: String,
    },
    /// The job was cancelled by a replica-set change or shutdown.
    Cancelled {
        /// The cancelled job.
        job: SyncJob,
    },
}

/// Counters for the health surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct SchedulerStats {
    /// Jobs waiting to be dispatched.
    pub queued: usize,
    /// Jobs currently executing on workers.
    pub running: usize,
    /// Jobs waiting out a retry backoff.
    pub retries_pending: usize,
    /// Jobs that failed permanently since startup.
    pub failed_exhausted: u64,
}

/// A dispatched job attempt, consumed by a worker.
#[derive(Debug)]
pub(crate) struct WorkItem {
    job: SyncJob,
    /// 0-based attempt counter, attempts after the first restart from the
    /// target's clock.
    attempt: usize,
    cancellation: CancellationToken,
}

/// What a worker reports back for a finished attempt.
#[derive(Debug)]
enum AttemptResult {
    Ok,
    Cancelled,
    Err(SyncError),
}

#[derive(derive_more::Debug)]
enum Message {
    /// Queue a sync job.
    Enqueue {
        job: SyncJob,
        #[debug("reply")]
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    /// A user's replica set changed, void jobs from older assignments.
    ReplicaSetChanged { user_id: UserId, blocknumber: u64 },
    /// An attempt finished on a worker.
    JobFinished {
        key: JobKey,
        attempt: usize,
        result: AttemptResult,
    },
    /// Counters for the health surface.
    Stats {
        #[debug("reply")]
        reply: oneshot::Sender<SchedulerStats>,
    },
}

/// Handle to the scheduler service. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Scheduler {
    msg_tx: mpsc::Sender<Message>,
}

impl Scheduler {
    /// Spawn the service task.
    ///
    /// Returns the handle and the work channel the [`Worker`] pool consumes.
    /// Terminal job outcomes are sent to `events`. The service stops when
    /// `shutdown` fires.
    pub(crate) fn spawn(
        config: &SyncConfig,
        events: mpsc::Sender<JobOutcome>,
        shutdown: CancellationToken,
    ) -> (Self, flume::Receiver<WorkItem>) {
        let (msg_tx, msg_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        // capacity matches the concurrency limit, so dispatch never blocks
        let (work_tx, work_rx) = flume::bounded(config.max_concurrent_jobs);
        let service = Service {
            msg_rx,
            work_tx,
            events,
            shutdown,
            limits: ConcurrencyLimits {
                max_concurrent_jobs: config.max_concurrent_jobs,
                max_queue_len: config.max_queue_len,
            },
            retry_config: RetryConfig {
                max_retries: config.max_retries as usize,
                initial_backoff: config.retry_initial_backoff,
                max_backoff: config.retry_max_backoff,
            },
            queue: VecDeque::new(),
            queued: HashMap::new(),
            running: HashMap::new(),
            retrying: HashMap::new(),
            retry_queue: DelayQueue::new(),
            failed_exhausted: 0,
        };
        tokio::spawn(service.run());
        (Self { msg_tx }, work_rx)
    }

    /// Queue a sync job.
    ///
    /// A job for the same user and target that is already queued or backing
    /// off absorbs this one (clock ranges are merged); a running one drops
    /// it.
    pub async fn enqueue(&self, job: SyncJob) -> anyhow::Result<EnqueueOutcome> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(Message::Enqueue { job, reply })
            .await
            .map_err(|_| anyhow!("scheduler service is gone"))?;
        Ok(rx.await?)
    }

    /// Notify the scheduler of a replica-set change.
    ///
    /// Jobs for this user created under a different blocknumber are
    /// cancelled, queued and running ones alike.
    pub async fn replica_set_changed(&self, user_id: UserId, blocknumber: u64) {
        if self
            .msg_tx
            .send(Message::ReplicaSetChanged {
                user_id,
                blocknumber,
            })
            .await
            .is_err()
        {
            debug!("scheduler service is gone, dropping replica-set change");
        }
    }

    /// Current queue and retry counters.
    pub async fn stats(&self) -> anyhow::Result<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(Message::Stats { reply })
            .await
            .map_err(|_| anyhow!("scheduler service is gone"))?;
        Ok(rx.await?)
    }
}

/// Concurrency limits for the service.
#[derive(Debug, Clone, Copy)]
struct ConcurrencyLimits {
    max_concurrent_jobs: usize,
    max_queue_len: usize,
}

/// Retry policy for failed attempts.
#[derive(Debug, Clone, Copy)]
struct RetryConfig {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

#[derive(Debug)]
struct QueuedJob {
    job: SyncJob,
    attempt: usize,
}

#[derive(Debug)]
struct ActiveJob {
    job: SyncJob,
    cancellation: CancellationToken,
}

#[derive(Debug)]
struct RetryJob {
    job: SyncJob,
    next_attempt: usize,
    delay_key: delay_queue::Key,
}

#[derive(Debug)]
struct Service {
    msg_rx: mpsc::Receiver<Message>,
    work_tx: flume::Sender<WorkItem>,
    events: mpsc::Sender<JobOutcome>,
    shutdown: CancellationToken,
    limits: ConcurrencyLimits,
    retry_config: RetryConfig,
    /// Dispatch order of the queued jobs.
    queue: VecDeque<JobKey>,
    /// Queued jobs by key.
    queued: HashMap<JobKey, QueuedJob>,
    /// Dispatched jobs that have not reported back yet.
    running: HashMap<JobKey, ActiveJob>,
    /// Jobs waiting out a retry backoff.
    retrying: HashMap<JobKey, RetryJob>,
    retry_queue: DelayQueue<JobKey>,
    failed_exhausted: u64,
}

impl Service {
    async fn run(mut self) {
        loop {
            trace!("scheduler tick");
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("scheduler service shutting down");
                    break;
                }
                Some(expired) = self.retry_queue.next(), if !self.retrying.is_empty() => {
                    self.on_retry_ready(expired.into_inner());
                }
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        debug!("all scheduler handles dropped, shutting down");
                        break;
                    }
                },
            }
            #[cfg(any(test, debug_assertions))]
            self.check_invariants();
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        trace!(?msg, "scheduler message");
        match msg {
            Message::Enqueue { job, reply } => {
                let outcome = self.on_enqueue(job);
                reply.send(outcome).ok();
            }
            Message::ReplicaSetChanged {
                user_id,
                blocknumber,
            } => {
                self.on_replica_set_changed(user_id, blocknumber).await;
            }
            Message::JobFinished {
                key,
                attempt,
                result,
            } => {
                self.on_job_finished(key, attempt, result).await;
            }
            Message::Stats { reply } => {
                reply
                    .send(SchedulerStats {
                        queued: self.queued.len(),
                        running: self.running.len(),
                        retries_pending: self.retrying.len(),
                        failed_exhausted: self.failed_exhausted,
                    })
                    .ok();
            }
        }
    }

    fn on_enqueue(&mut self, job: SyncJob) -> EnqueueOutcome {
        let key = job.key();
        if self.running.contains_key(&key) {
            // running jobs are not extended, the next sweep covers the rest
            trace!(user = %job.user_id, target = %job.target, "job already running, dropping");
            inc!(Metrics, jobs_dropped);
            return EnqueueOutcome::Dropped;
        }
        if let Some(queued) = self.queued.get_mut(&key) {
            merge(&mut queued.job, &job);
            inc!(Metrics, jobs_merged);
            return EnqueueOutcome::Merged;
        }
        if let Some(retrying) = self.retrying.get_mut(&key) {
            merge(&mut retrying.job, &job);
            inc!(Metrics, jobs_merged);
            return EnqueueOutcome::Merged;
        }
        if self.queued.len() >= self.limits.max_queue_len {
            warn!(user = %job.user_id, target = %job.target, "sync queue full, dropping job");
            inc!(Metrics, jobs_queue_full);
            return EnqueueOutcome::QueueFull;
        }
        debug!(
            user = %job.user_id,
            target = %job.target,
            low = job.low,
            high = job.high,
            "queueing sync job"
        );
        inc!(Metrics, jobs_enqueued);
        self.queue.push_back(key.clone());
        self.queued.insert(key, QueuedJob { job, attempt: 0 });
        self.dispatch();
        EnqueueOutcome::Enqueued
    }

    async fn on_replica_set_changed(&mut self, user_id: UserId, blocknumber: u64) {
        let stale: Vec<JobKey> = self
            .queued
            .iter()
            .filter(|(key, queued)| key.0 == user_id && queued.job.blocknumber != blocknumber)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            let queued = self
                .queued
                .remove(&key)
                .expect("stale key was just listed");
            self.queue.retain(|k| k != &key);
            self.cancel(queued.job).await;
        }

        let stale: Vec<JobKey> = self
            .retrying
            .iter()
            .filter(|(key, retry)| key.0 == user_id && retry.job.blocknumber != blocknumber)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            let retry = self
                .retrying
                .remove(&key)
                .expect("stale key was just listed");
            self.retry_queue.remove(&retry.delay_key);
            self.cancel(retry.job).await;
        }

        // running jobs report back as cancelled through their worker
        for (key, active) in self.running.iter() {
            if key.0 == user_id && active.job.blocknumber != blocknumber {
                debug!(user = %user_id, target = %key.1, "cancelling running sync job");
                active.cancellation.cancel();
            }
        }
    }

    async fn on_job_finished(&mut self, key: JobKey, attempt: usize, result: AttemptResult) {
        let active = self
            .running
            .remove(&key)
            .expect("finished job was running");
        let job = active.job;
        match result {
            AttemptResult::Ok => {
                debug!(
                    user = %job.user_id,
                    target = %job.target,
                    high = job.high,
                    attempts = attempt + 1,
                    "sync job succeeded"
                );
                inc!(Metrics, jobs_succeeded);
                self.emit(JobOutcome::Succeeded {
                    job,
                    attempts: attempt + 1,
                })
                .await;
            }
            AttemptResult::Cancelled => {
                inc!(Metrics, jobs_cancelled);
                self.emit(JobOutcome::Cancelled { job }).await;
            }
            AttemptResult::Err(err) if err.is_stale() => {
                debug!(user = %job.user_id, target = %job.target, %err, "sync job is stale, cancelling");
                inc!(Metrics, jobs_cancelled);
                self.emit(JobOutcome::Cancelled { job }).await;
            }
            AttemptResult::Err(err)
                if err.is_retryable() && attempt < self.retry_config.max_retries =>
            {
                let next_attempt = attempt + 1;
                let delay = self.retry_delay(next_attempt);
                debug!(
                    user = %job.user_id,
                    target = %job.target,
                    retry = next_attempt,
                    ?delay,
                    %err,
                    "sync attempt failed, backing off"
                );
                inc!(Metrics, jobs_retried);
                let delay_key = self.retry_queue.insert(key.clone(), delay);
                self.retrying.insert(
                    key,
                    RetryJob {
                        job,
                        next_attempt,
                        delay_key,
                    },
                );
            }
            AttemptResult::Err(err) => {
                error!(
                    user = %job.user_id,
                    target = %job.target,
                    attempts = attempt + 1,
                    %err,
                    "sync job failed permanently"
                );
                inc!(Metrics, jobs_failed);
                self.failed_exhausted += 1;
                self.emit(JobOutcome::Failed {
                    job,
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                })
                .await;
            }
        }
        self.dispatch();
    }

    fn on_retry_ready(&mut self, key: JobKey) {
        let Some(retry) = self.retrying.remove(&key) else {
            // cancelled while the delay ran
            return;
        };
        trace!(user = %key.0, target = %key.1, attempt = retry.next_attempt, "retry backoff over");
        self.queue.push_back(key.clone());
        self.queued.insert(
            key,
            QueuedJob {
                job: retry.job,
                attempt: retry.next_attempt,
            },
        );
        self.dispatch();
    }

    /// Move queued jobs to the workers while below the concurrency limit.
    fn dispatch(&mut self) {
        while self.running.len() < self.limits.max_concurrent_jobs {
            let Some(key) = self.queue.front() else {
                break;
            };
            let queued = self
                .queued
                .get(key)
                .expect("ordered key must be queued");
            let cancellation = CancellationToken::new();
            let item = WorkItem {
                job: queued.job.clone(),
                attempt: queued.attempt,
                cancellation: cancellation.clone(),
            };
            match self.work_tx.try_send(item) {
                Ok(()) => {
                    let key = self.queue.pop_front().expect("checked above");
                    let queued = self.queued.remove(&key).expect("checked above");
                    self.running.insert(
                        key,
                        ActiveJob {
                            job: queued.job,
                            cancellation,
                        },
                    );
                }
                Err(flume::TrySendError::Full(_)) => break,
                Err(flume::TrySendError::Disconnected(_)) => {
                    debug!("worker pool is gone, not dispatching");
                    break;
                }
            }
        }
    }

    async fn cancel(&mut self, job: SyncJob) {
        debug!(user = %job.user_id, target = %job.target, "cancelling pending sync job");
        inc!(Metrics, jobs_cancelled);
        self.emit(JobOutcome::Cancelled { job }).await;
    }

    async fn emit(&self, outcome: JobOutcome) {
        if self.events.send(outcome).await.is_err() {
            debug!("job outcome receiver is gone");
        }
    }

    /// Exponential backoff for the given retry, with jitter so failures do
    /// not retry in lockstep.
    fn retry_delay(&self, retry: usize) -> Duration {
        let exp = retry.saturating_sub(1).min(16) as u32;
        let base = self
            .retry_config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        let capped = base.min(self.retry_config.max_backoff);
        capped.mul_f64(rand::thread_rng().gen_range(1.0..1.25))
    }

    /// Checks the internal bookkeeping invariants.
    #[cfg(any(test, debug_assertions))]
    fn check_invariants(&self) {
        assert_eq!(
            self.queue.len(),
            self.queued.len(),
            "dispatch order and queued set must match"
        );
        for key in &self.queue {
            assert!(
                self.queued.contains_key(key),
                "ordered key must have a queued job"
            );
        }
        assert_eq!(
            self.retrying.len(),
            self.retry_queue.len(),
            "retry set and delay queue must match"
        );
        assert!(
            self.running.len() <= self.limits.max_concurrent_jobs,
            "running jobs must stay within the concurrency limit"
        );
        for key in self.queued.keys() {
            assert!(
                !self.running.contains_key(key) && !self.retrying.contains_key(key),
                "a key must be in at most one state"
            );
        }
        for key in self.retrying.keys() {
            assert!(
                !self.running.contains_key(key),
                "a key must be in at most one state"
            );
        }
    }
}

/// Extend a pending job with a newer request for the same key.
fn merge(current: &mut SyncJob, incoming: &SyncJob) {
    if current.blocknumber == incoming.blocknumber {
        current.low = current.low.min(incoming.low);
        current.high = current.high.max(incoming.high);
    } else if incoming.blocknumber > current.blocknumber {
        // the older assignment is void
        *current = incoming.clone();
    }
}

/// A sync job executor.
///
/// Workers pull dispatched jobs from the shared work channel, so the pool
/// drains the queue in parallel. Each worker also listens for leadership
/// grants from the coordinator; the one holding the token spawns the
/// reconciliation loop on top of its job processing.
#[derive(Debug)]
pub(crate) struct Worker {
    id: WorkerId,
    leadership: mpsc::Receiver<LeaderGrant>,
    msg_tx: mpsc::Sender<Message>,
    work_rx: flume::Receiver<WorkItem>,
    store: Store,
    client: SyncClient,
    me: Url,
    batch_limit: u64,
    reconciler: Reconciler,
    shutdown: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: WorkerId,
        leadership: mpsc::Receiver<LeaderGrant>,
        scheduler: &Scheduler,
        work_rx: flume::Receiver<WorkItem>,
        store: Store,
        client: SyncClient,
        me: Url,
        config: &SyncConfig,
        reconciler: Reconciler,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            leadership,
            msg_tx: scheduler.msg_tx.clone(),
            work_rx,
            store,
            client,
            me,
            batch_limit: config.max_export_range,
            reconciler,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(worker = %self.id, "worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                grant = self.leadership.recv() => match grant {
                    Some(grant) => {
                        info!(worker = %self.id, epoch = grant.token.epoch(), "elected leader, starting reconciliation");
                        let reconciler = self.reconciler.clone();
                        tokio::spawn(reconciler.run(grant));
                    }
                    None => break,
                },
                item = self.work_rx.recv_async() => match item {
                    Ok(item) => self.process(item).await,
                    Err(_) => break,
                },
            }
        }
        debug!(worker = %self.id, "worker stopped");
    }

    async fn process(&self, item: WorkItem) {
        let WorkItem {
            job,
            attempt,
            cancellation,
        } = item;
        let key = job.key();
        trace!(worker = %self.id, user = %job.user_id, target = %job.target, attempt, "sync attempt");
        let result = tokio::select! {
            _ = cancellation.cancelled() => AttemptResult::Cancelled,
            res = transfer::execute(&self.store, &self.client, &self.me, &job, attempt, self.batch_limit) => {
                match res {
                    Ok(()) => AttemptResult::Ok,
                    Err(err) => AttemptResult::Err(err),
                }
            }
        };
        if self
            .msg_tx
            .send(Message::JobFinished {
                key,
                attempt,
                result,
            })
            .await
            .is_err()
        {
            debug!("scheduler service is gone, dropping job result");
        }
    }
}
