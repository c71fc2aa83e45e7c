//! Worker coordination and leader election.
//!
//! Every worker registers with the coordinator at startup and gets back a
//! worker id and a channel for leadership grants. The coordinator elects the
//! lowest registered id and hands it the [`LeaderToken`] for a fresh epoch.
//! The token is deliberately not `Clone`: there is exactly one per epoch, so
//! holding it proves the holder is the elected leader and at most one
//! reconciliation loop can run. Resignation surrenders the token; the
//! coordinator then cancels the epoch, invalidates completion routing and
//! elects the next lowest id.
//!
//! Terminal sync job outcomes flow through the coordinator to the completion
//! inbox the current leader registered, so a leader change never leaves a
//! stale consumer attached.

use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sched::JobOutcome;

/// Identifies a registered worker. Ids are assigned in registration order.
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
)]
pub struct WorkerId(u64);

/// Capability of the elected leader.
///
/// Exactly one exists per epoch and it cannot be cloned. It moves into the
/// reconciliation loop and is surrendered on resignation.
#[derive(Debug)]
pub struct LeaderToken {
    worker: WorkerId,
    epoch: u64,
}

impl LeaderToken {
    /// The worker this token was granted to.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The election epoch this token is valid for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A leadership grant, delivered over the channel handed out at
/// registration.
#[derive(Debug)]
pub struct LeaderGrant {
    /// The capability token for this epoch.
    pub token: LeaderToken,
    /// Fires when the epoch ends. Whatever runs under the token must stop.
    pub cancelled: CancellationToken,
}

/// Election state, for the health surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    /// The current election epoch.
    pub epoch: u64,
    /// The elected worker, if any.
    pub leader: Option<WorkerId>,
}

#[derive(derive_more::Debug)]
enum Message {
    Register {
        #[debug("reply")]
        reply: oneshot::Sender<(WorkerId, mpsc::Receiver<LeaderGrant>)>,
    },
    Resign {
        token: LeaderToken,
    },
    Deregister {
        worker: WorkerId,
    },
    RegisterCompletions {
        epoch: u64,
        #[debug(skip)]
        completions: mpsc::Sender<JobOutcome>,
        #[debug("reply")]
        reply: oneshot::Sender<bool>,
    },
    JobCompleted {
        outcome: JobOutcome,
    },
    Status {
        #[debug("reply")]
        reply: oneshot::Sender<CoordinatorStatus>,
    },
}

/// Handle to the coordinator actor. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Coordinator {
    msg_tx: mpsc::Sender<Message>,
}

impl Coordinator {
    /// Spawn the coordinator actor. It stops when `shutdown` fires.
    pub fn spawn(shutdown: CancellationToken) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(16);
        let actor = Actor {
            msg_rx,
            shutdown,
            next_worker: 0,
            workers: BTreeMap::new(),
            epoch: 0,
            leader: None,
            epoch_cancel: CancellationToken::new(),
            completions: None,
        };
        tokio::spawn(actor.run());
        Self { msg_tx }
    }

    /// Register a worker. Returns its id and the channel leadership grants
    /// arrive on.
    pub async fn register(&self) -> anyhow::Result<(WorkerId, mpsc::Receiver<LeaderGrant>)> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(Message::Register { reply })
            .await
            .map_err(|_| anyhow!("coordinator is gone"))?;
        Ok(rx.await?)
    }

    /// Surrender leadership. The coordinator cancels the epoch and elects
    /// the next worker; the resigning worker is out of the candidate set.
    pub async fn resign(&self, token: LeaderToken) {
        if self
            .msg_tx
            .send(Message::Resign { token })
            .await
            .is_err()
        {
            debug!("coordinator is gone, dropping resignation");
        }
    }

    /// Remove an exited worker from the candidate set, triggering a new
    /// election if it led.
    pub async fn deregister(&self, worker: WorkerId) {
        if self
            .msg_tx
            .send(Message::Deregister { worker })
            .await
            .is_err()
        {
            debug!("coordinator is gone, dropping deregistration");
        }
    }

    /// Register the inbox terminal job outcomes are routed to.
    ///
    /// Returns false when the token's epoch is over, in which case the
    /// caller has lost leadership.
    pub async fn register_completions(
        &self,
        token: &LeaderToken,
        completions: mpsc::Sender<JobOutcome>,
    ) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(Message::RegisterCompletions {
                epoch: token.epoch(),
                completions,
                reply,
            })
            .await
            .map_err(|_| anyhow!("coordinator is gone"))?;
        Ok(rx.await?)
    }

    /// Route a terminal job outcome to the current leader.
    pub async fn job_completed(&self, outcome: JobOutcome) {
        if self
            .msg_tx
            .send(Message::JobCompleted { outcome })
            .await
            .is_err()
        {
            debug!("coordinator is gone, dropping job outcome");
        }
    }

    /// Current election state.
    pub async fn status(&self) -> anyhow::Result<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.msg_tx
            .send(Message::Status { reply })
            .await
            .map_err(|_| anyhow!("coordinator is gone"))?;
        Ok(rx.await?)
    }
}

#[derive(Debug)]
struct WorkerHandle {
    grants: mpsc::Sender<LeaderGrant>,
}

#[derive(Debug)]
struct Actor {
    msg_rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    next_worker: u64,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    epoch: u64,
    leader: Option<WorkerId>,
    /// Cancels whatever runs under the current epoch's token.
    epoch_cancel: CancellationToken,
    /// The current leader's completion inbox. Cleared when its epoch ends.
    completions: Option<mpsc::Sender<JobOutcome>>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }
        self.epoch_cancel.cancel();
        debug!("coordinator stopped");
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Register { reply } => {
                let id = WorkerId(self.next_worker);
                self.next_worker += 1;
                let (grants, rx) = mpsc::channel(1);
                self.workers.insert(id, WorkerHandle { grants });
                debug!(worker = %id, "worker registered");
                reply.send((id, rx)).ok();
                self.elect().await;
            }
            Message::Resign { token } => {
                if token.epoch != self.epoch || self.leader != Some(token.worker) {
                    debug!(worker = %token.worker, epoch = token.epoch, "stale resignation, ignoring");
                    return;
                }
                info!(worker = %token.worker, epoch = token.epoch, "leader resigned");
                self.workers.remove(&token.worker);
                self.end_epoch();
                self.elect().await;
            }
            Message::Deregister { worker } => {
                if self.workers.remove(&worker).is_none() {
                    return;
                }
                debug!(worker = %worker, "worker deregistered");
                if self.leader == Some(worker) {
                    self.end_epoch();
                    self.elect().await;
                }
            }
            Message::RegisterCompletions {
                epoch,
                completions,
                reply,
            } => {
                let valid = epoch == self.epoch && self.leader.is_some();
                if valid {
                    self.completions = Some(completions);
                }
                reply.send(valid).ok();
            }
            Message::JobCompleted { outcome } => self.route_completion(outcome),
            Message::Status { reply } => {
                reply
                    .send(CoordinatorStatus {
                        epoch: self.epoch,
                        leader: self.leader,
                    })
                    .ok();
            }
        }
    }

    /// Close out the current epoch: stop its loops and routing.
    fn end_epoch(&mut self) {
        self.epoch_cancel.cancel();
        self.completions = None;
        self.leader = None;
    }

    /// Elect the lowest registered id, skipping workers that are gone.
    async fn elect(&mut self) {
        while self.leader.is_none() {
            let Some((&id, handle)) = self.workers.iter().next() else {
                warn!("no workers registered, nothing leads reconciliation");
                return;
            };
            self.epoch += 1;
            let cancelled = CancellationToken::new();
            let grant = LeaderGrant {
                token: LeaderToken {
                    worker: id,
                    epoch: self.epoch,
                },
                cancelled: cancelled.clone(),
            };
            if handle.grants.send(grant).await.is_ok() {
                info!(worker = %id, epoch = self.epoch, "elected leader");
                self.leader = Some(id);
                self.epoch_cancel = cancelled;
            } else {
                debug!(worker = %id, "worker is gone, removing from election");
                self.workers.remove(&id);
            }
        }
    }

    fn route_completion(&mut self, outcome: JobOutcome) {
        let Some(completions) = &self.completions else {
            warn!("no leader inbox registered, dropping job outcome");
            return;
        };
        match completions.try_send(outcome) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("leader completion inbox is full, dropping job outcome");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("leader completion inbox is gone");
                self.completions = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sched::SyncJob, store::UserId};

    fn outcome() -> JobOutcome {
        JobOutcome::Succeeded {
            job: SyncJob {
                user_id: UserId(1),
                target: "http://a".parse().unwrap(),
                low: 0,
                high: 5,
                blocknumber: 1,
            },
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn first_registrant_becomes_leader() {
        let coordinator = Coordinator::spawn(CancellationToken::new());
        let (w0, mut rx0) = coordinator.register().await.unwrap();
        let grant = rx0.recv().await.unwrap();
        assert_eq!(grant.token.worker(), w0);
        assert_eq!(grant.token.epoch(), 1);

        let (_w1, mut rx1) = coordinator.register().await.unwrap();
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.leader, Some(w0));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn resignation_elects_the_next_worker() {
        let coordinator = Coordinator::spawn(CancellationToken::new());
        let (_w0, mut rx0) = coordinator.register().await.unwrap();
        let (w1, mut rx1) = coordinator.register().await.unwrap();
        let grant = rx0.recv().await.unwrap();

        coordinator.resign(grant.token).await;

        let next = rx1.recv().await.unwrap();
        assert_eq!(next.token.worker(), w1);
        assert_eq!(next.token.epoch(), 2);
        // the old epoch is cancelled, its loops must stop
        assert!(grant.cancelled.is_cancelled());
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.leader, Some(w1));
    }

    #[tokio::test]
    async fn worker_exit_triggers_reelection() {
        let coordinator = Coordinator::spawn(CancellationToken::new());
        let (w0, mut rx0) = coordinator.register().await.unwrap();
        let (w1, mut rx1) = coordinator.register().await.unwrap();
        let grant = rx0.recv().await.unwrap();
        assert_eq!(grant.token.worker(), w0);

        coordinator.deregister(w0).await;

        let next = rx1.recv().await.unwrap();
        assert_eq!(next.token.worker(), w1);
        assert!(grant.cancelled.is_cancelled());
    }

    #[tokio::test]
    async fn completions_route_to_the_current_leader_only() {
        let coordinator = Coordinator::spawn(CancellationToken::new());
        let (_w0, mut rx0) = coordinator.register().await.unwrap();
        let (_w1, mut rx1) = coordinator.register().await.unwrap();
        let grant = rx0.recv().await.unwrap();

        let (tx, mut inbox) = mpsc::channel(4);
        assert!(coordinator
            .register_completions(&grant.token, tx)
            .await
            .unwrap());
        coordinator.job_completed(outcome()).await;
        assert!(matches!(
            inbox.recv().await.unwrap(),
            JobOutcome::Succeeded { .. }
        ));

        // after resignation the old token no longer registers an inbox
        let token = grant.token;
        coordinator.resign(token).await;
        let next = rx1.recv().await.unwrap();

        let (stale_tx, _stale_inbox) = mpsc::channel(4);
        // a forged registration with the old epoch is refused
        let stale = LeaderToken {
            worker: next.token.worker(),
            epoch: next.token.epoch() - 1,
        };
        assert!(!coordinator
            .register_completions(&stale, stale_tx)
            .await
            .unwrap());

        // outcomes are dropped until the new leader registers
        coordinator.job_completed(outcome()).await;
        let (tx, mut inbox) = mpsc::channel(4);
        assert!(coordinator
            .register_completions(&next.token, tx)
            .await
            .unwrap());
        coordinator.job_completed(outcome()).await;
        assert!(matches!(
            inbox.recv().await.unwrap(),
            JobOutcome::Succeeded { .. }
        ));
    }

    #[tokio::test]
    async fn stale_resignations_are_ignored() {
        let coordinator = Coordinator::spawn(CancellationToken::new());
        let (_w0, mut rx0) = coordinator.register().await.unwrap();
        let (w1, mut rx1) = coordinator.register().await.unwrap();
        let old = rx0.recv().await.unwrap();
        coordinator.resign(old.token).await;
        let current = rx1.recv().await.unwrap();

        // a token from a previous epoch cannot depose the current leader
        let stale = LeaderToken {
            worker: w1,
            epoch: current.token.epoch() - 1,
        };
        coordinator.resign(stale).await;
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.leader, Some(w1));
        assert!(!current.cancelled.is_cancelled());
    }
}
