//! The sending side of replica synchronization.
//!
//! A sync job pushes one user's clock range to one target replica. Every
//! attempt starts by asking the target for its clock: a target that has
//! caught up in the meantime turns the attempt into a no-op, and a retry
//! restarts from the target's clock rather than the job's lower bound, so
//! ranges the target lost (a dropped gap buffer, a restored backup) are sent
//! again. Within an attempt, capped batches are pushed for as long as the
//! target makes progress.

use anyhow::{anyhow, Context};
use iroh_metrics::{inc, inc_by};
use reqwest::StatusCode;
use tracing::{debug, trace};
use url::Url;

use crate::{
    config::SyncConfig,
    metrics::Metrics,
    sched::SyncJob,
    store::{Store, UserId},
};

use super::{export_entries, ApplyBatch, ApplyResponse, DigestResponse, SYNC_SECRET_HEADER};

/// Ways a sync attempt can fail.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The target could not be reached or timed out.
    #[error("target unreachable")]
    Unreachable(#[source] reqwest::Error),
    /// The target answered with a server error.
    #[error("target unavailable: {status}: {detail}")]
    Unavailable {
        /// The response status.
        status: StatusCode,
        /// The response body.
        detail: String,
    },
    /// The target accepted the batch but could not advance past a gap.
    #[error("target stalled at clock {applied_up_to} with {buffered} entries buffered")]
    Gap {
        /// The clock the target has applied up to.
        applied_up_to: u64,
        /// Entries the target holds back waiting for the gap to fill.
        buffered: usize,
    },
    /// The target refused the request, e.g. a digest mismatch.
    #[error("target rejected the request: {status}: {detail}")]
    Rejected {
        /// The response status.
        status: StatusCode,
        /// The response body.
        detail: String,
    },
    /// The job no longer matches the stored replica set.
    #[error("replica set changed: {0}")]
    Stale(&'static str),
    /// A local invariant failed while exporting.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether a later attempt can succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable(_) | SyncError::Unavailable { .. } | SyncError::Gap { .. }
        )
    }

    /// Whether the job should be cancelled rather than counted as failed.
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::Stale(_))
    }
}

/// HTTP client for the node-to-node endpoints of other replicas.
///
/// Cheaply cloneable, connections are pooled underneath.
#[derive(Debug, Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    secret: Option<String>,
}

impl SyncClient {
    /// Build a client with the configured request timeout.
    pub fn new(config: &SyncConfig, secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build sync http client")?;
        Ok(Self { http, secret })
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(secret) = &self.secret {
            req = req.header(SYNC_SECRET_HEADER, secret);
        }
        req
    }

    /// Fetch the target's clock and digest summary over `(low, high]`.
    pub async fn digest(
        &self,
        target: &Url,
        user_id: UserId,
        low: u64,
        high: u64,
    ) -> Result<DigestResponse, SyncError> {
        let url = target.join("/digest").map_err(|e| anyhow!(e))?;
        let res = self
            .request(reqwest::Method::GET, url)
            .query(&[("user_id", user_id.0), ("low", low), ("high", high)])
            .send()
            .await
            .map_err(SyncError::Unreachable)?;
        let res = ok_or_err(res).await?;
        let digest = res.json().await.map_err(|e| anyhow!(e))?;
        Ok(digest)
    }

    /// Push a batch of entries to the target.
    pub async fn apply(
        &self,
        target: &Url,
        batch: &ApplyBatch,
    ) -> Result<ApplyResponse, SyncError> {
        let url = target.join("/sync-apply").map_err(|e| anyhow!(e))?;
        let body = postcard::to_stdvec(batch).map_err(|e| anyhow!(e))?;
        let res = self
            .request(reqwest::Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(SyncError::Unreachable)?;
        let res = ok_or_err(res).await?;
        let bytes = res.bytes().await.map_err(|e| anyhow!(e))?;
        let response = postcard::from_bytes(&bytes).map_err(|e| anyhow!(e))?;
        Ok(response)
    }
}

/// Split error responses into retryable (5xx) and terminal (4xx).
async fn ok_or_err(res: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let detail = res.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(SyncError::Unavailable { status, detail })
    } else {
        Err(SyncError::Rejected { status, detail })
    }
}

/// Run one attempt of a sync job.
///
/// Returns `Ok(())` once the target's clock is at or above the job's upper
/// bound, which makes replayed and raced jobs no-ops.
pub(crate) async fn execute(
    store: &Store,
    client: &SyncClient,
    me: &Url,
    job: &SyncJob,
    attempt: usize,
    batch_limit: u64,
) -> Result<(), SyncError> {
    check_assignment(store, me, job)?;

    let remote = client.digest(&job.target, job.user_id, 0, 0).await?;
    if remote.clock >= job.high {
        trace!(user = %job.user_id, clock = remote.clock, "target already caught up");
        return Ok(());
    }

    let mut cursor = if attempt == 0 {
        job.low.max(remote.clock)
    } else {
        remote.clock
    };
    loop {
        let export = export_entries(store, job.user_id, cursor, job.high, batch_limit)
            .await?
            .context("user has no log while a sync job for it is running")?;
        // the log is append-only and dense, a non-empty range exports entries
        if export.entries.is_empty() {
            return Err(SyncError::Internal(anyhow!(
                "export for ({}, {}] returned no entries",
                cursor,
                job.high
            )));
        }
        let sent = export.entries.len() as u64;
        let batch = ApplyBatch {
            user_id: job.user_id,
            wallet: export.wallet,
            entries: export.entries,
        };
        let response = client.apply(&job.target, &batch).await?;
        inc!(Metrics, sync_batches_sent);
        inc_by!(Metrics, entries_sent, sent);
        debug!(
            user = %job.user_id,
            target = %job.target,
            sent,
            applied_up_to = response.applied_up_to,
            buffered = response.buffered,
            "pushed sync batch"
        );
        if response.applied_up_to >= job.high {
            return Ok(());
        }
        if response.applied_up_to > cursor {
            cursor = response.applied_up_to;
            continue;
        }
        return Err(SyncError::Gap {
            applied_up_to: response.applied_up_to,
            buffered: response.buffered,
        });
    }
}

/// A job is only valid as long as the replica set it was created under.
fn check_assignment(store: &Store, me: &Url, job: &SyncJob) -> Result<(), SyncError> {
    let rs = store
        .replica_set(job.user_id)?
        .ok_or(SyncError::Stale("no replica set on record"))?;
    if rs.blocknumber != job.blocknumber {
        return Err(SyncError::Stale("replica set superseded"));
    }
    if !rs.is_primary(me) {
        return Err(SyncError::Stale("this node is no longer the primary"));
    }
    if !rs.is_secondary(&job.target) {
        return Err(SyncError::Stale("target is no longer a secondary"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        replica_set::ReplicaSet,
        server::Server,
        store::{PutContent, StoreOptions},
    };

    fn replica_set(primary: &Url, secondary: &Url, blocknumber: u64) -> ReplicaSet {
        ReplicaSet {
            user_id: UserId(1),
            wallet: "0xw".to_string(),
            primary: primary.clone(),
            secondaries: vec![secondary.clone()],
            blocknumber,
        }
    }

    /// A primary store with ten entries for user 1, assigned to push to
    /// `target`.
    async fn primary_store(target: &Url, me: &Url) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        for i in 1u64..=10 {
            store
                .put_content(PutContent {
                    user_id: UserId(1),
                    wallet: "0xw".to_string(),
                    entity_id: None,
                    gated: false,
                    bytes: Bytes::copy_from_slice(format!("track-{i}").as_bytes()),
                })
                .await
                .unwrap();
        }
        store
            .apply_replica_set(&replica_set(me, target, 1), me)
            .unwrap();
        (dir, store)
    }

    fn sync_job(target: &Url, low: u64, high: u64) -> SyncJob {
        SyncJob {
            user_id: UserId(1),
            target: target.clone(),
            low,
            high,
            blocknumber: 1,
        }
    }

    #[tokio::test]
    async fn capped_batches_walk_the_full_range() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let me: Url = "http://me.example".parse().unwrap();
        let (_dir, store) = primary_store(&remote_url, &me).await;
        let client = SyncClient::new(&SyncConfig::default(), None).unwrap();

        // ten entries in batches of three take four round trips
        let job = sync_job(&remote_url, 0, 10);
        execute(&store, &client, &me, &job, 0, 3).await.unwrap();

        let remote_digest = client.digest(&remote_url, UserId(1), 0, 10).await.unwrap();
        assert_eq!(remote_digest.clock, 10);
        assert_eq!(
            remote_digest.summary,
            store.summary(UserId(1), 0, 10).unwrap()
        );

        // replaying the job against the caught-up target is a no-op
        execute(&store, &client, &me, &job, 0, 3).await.unwrap();
        let remote_digest = client.digest(&remote_url, UserId(1), 0, 10).await.unwrap();
        assert_eq!(remote_digest.clock, 10);

        remote.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn overshooting_job_stalls_then_heals_on_retry() {
        let (remote, _remote_dir, remote_url) = Server::spawn_for_tests().await.unwrap();
        let me: Url = "http://me.example".parse().unwrap();
        let (_dir, store) = primary_store(&remote_url, &me).await;
        let client = SyncClient::new(&SyncConfig::default(), None).unwrap();

        // the job's lower bound overshoots the fresh target, which buffers
        // everything and cannot advance
        let job = sync_job(&remote_url, 5, 10);
        let err = execute(&store, &client, &me, &job, 0, 100)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        match err {
            SyncError::Gap {
                applied_up_to,
                buffered,
            } => {
                assert_eq!(applied_up_to, 0);
                assert_eq!(buffered, 5);
            }
            other => panic!("expected a gap, got {other:?}"),
        }

        // the retry restarts from the target's clock, filling the gap and
        // draining its buffer
        execute(&store, &client, &me, &job, 1, 100).await.unwrap();
        let remote_digest = client.digest(&remote_url, UserId(1), 0, 10).await.unwrap();
        assert_eq!(remote_digest.clock, 10);
        assert_eq!(
            remote_digest.summary,
            store.summary(UserId(1), 0, 10).unwrap()
        );

        remote.shutdown().await.unwrap();
    }

    #[test]
    fn assignment_checks_catch_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), StoreOptions::default()).unwrap();
        let me: Url = "http://me.example".parse().unwrap();
        let target: Url = "http://target.example".parse().unwrap();
        let job = SyncJob {
            user_id: UserId(1),
            target: target.clone(),
            low: 0,
            high: 10,
            blocknumber: 7,
        };

        // no replica set on record
        assert!(check_assignment(&store, &me, &job).unwrap_err().is_stale());

        store
            .apply_replica_set(&replica_set(&me, &target, 7), &me)
            .unwrap();
        assert!(check_assignment(&store, &me, &job).is_ok());

        // a newer replica set supersedes the job's blocknumber
        store
            .apply_replica_set(&replica_set(&me, &target, 8), &me)
            .unwrap();
        assert!(check_assignment(&store, &me, &job).unwrap_err().is_stale());

        // the job's blocknumber but a different primary
        let other: Url = "http://other.example".parse().unwrap();
        let job = SyncJob {
            blocknumber: 9,
            ..job
        };
        store
            .apply_replica_set(&replica_set(&other, &target, 9), &me)
            .unwrap();
        assert!(check_assignment(&store, &me, &job).unwrap_err().is_stale());
    }

    #[test]
    fn error_classification() {
        assert!(SyncError::Gap {
            applied_up_to: 3,
            buffered: 2
        }
        .is_retryable());
        assert!(SyncError::Unavailable {
            status: StatusCode::SERVICE_UNAVAILABLE,
            detail: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Rejected {
            status: StatusCode::CONFLICT,
            detail: String::new()
        }
        .is_retryable());
        assert!(SyncError::Stale("x").is_stale());
        assert!(!SyncError::Stale("x").is_retryable());
    }
}
