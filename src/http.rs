//! HTTP server part of the node
//!
//! Serves the public content API, the replica-to-replica protocol and the
//! health surface on a single listener.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Instant,
};

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{HeaderMap, Method},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use iroh_metrics::{inc, inc_by};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, span, warn, Level};

mod content;
mod error;
mod replication;

use crate::{metrics::Metrics, sched::SchedulerStats, state::AppState, sync::SYNC_SECRET_HEADER};

use self::error::AppResult;

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset)
    pub bind_addr: Option<IpAddr>,
}

/// The HTTP server part of the node
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    addr: SocketAddr,
}

/// Bind the listener for the HTTP server.
///
/// Binding is separate from serving so the caller can derive the node's
/// endpoint from the bound address before the rest of the node is built.
pub async fn bind(config: &HttpConfig) -> Result<TcpListener> {
    let bind_addr = SocketAddr::new(
        config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
        config.port,
    );
    let listener = TcpListener::bind(bind_addr).await?;
    Ok(listener)
}

impl HttpServer {
    /// Spawn the server on a bound listener
    pub fn spawn(listener: TcpListener, state: AppState) -> Result<HttpServer> {
        let app = create_app(state);
        let addr = listener.local_addr()?;
        let mut tasks = JoinSet::new();
        let fut = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        );
        info!("HTTP server listening on {addr}");
        tasks.spawn(async move { fut.await });
        Ok(HttpServer { tasks, addr })
    }

    /// Get the bound address of the HTTP socket.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tasks.abort_all();
        self.run_until_done().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let conn_info = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .expect("connectinfo extension to be present");
        let span = span!(
        Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = %conn_info.0,
            );
        span
    });

    // the default body limit is far below a content upload
    let body_limit = state.store.max_file_size().saturating_add(1024 * 1024) as usize;

    // configure routes
    let router = Router::new()
        .route("/content", post(content::put))
        .route("/content/:digest", get(content::get))
        .route("/digest", get(replication::digest))
        .route("/export", get(replication::export))
        .route("/sync-apply", post(replication::sync_apply))
        .route("/replica-set", post(replication::put_replica_set))
        .route("/healthz", get(healthz))
        .route("/", get(|| async { "holdfast" }))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    // configure app
    router
        .layer(cors)
        .layer(trace)
        .route_layer(middleware::from_fn(metrics_middleware))
}

/// The health surface of a node.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Number of users with a record on this node.
    pub users: u64,
    /// Sync queue counters.
    pub sync: SchedulerStats,
    /// Entries parked in apply-side gap buffers.
    pub buffered_entries: usize,
    /// Whether a worker of this process holds the leader token.
    pub is_leader: bool,
    /// The current election epoch.
    pub leader_epoch: u64,
    /// Users with at least one replica flagged as diverged.
    pub diverged_users: usize,
}

/// GET `/healthz`
async fn healthz(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let coordinator = state.coordinator.status().await?;
    let sync = state.scheduler.stats().await?;
    Ok(Json(HealthResponse {
        users: state.store.num_users()?,
        sync,
        buffered_entries: state.applier.buffered_entries(),
        is_leader: coordinator.leader.is_some(),
        leader_epoch: coordinator.epoch,
        diverged_users: state.diverged.user_count(),
    }))
}

/// Whether a request carries the configured sync secret. Everything is
/// authorized when no secret is configured.
pub(crate) fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(secret) = &state.sync_secret else {
        return true;
    };
    headers
        .get(SYNC_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == secret)
        .unwrap_or(false)
}

/// Record request metrics.
async fn metrics_middleware(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    inc_by!(Metrics, http_requests_duration_ms, latency as u64);
    inc!(Metrics, http_requests);
    if status.is_success() {
        inc!(Metrics, http_requests_success);
    } else {
        inc!(Metrics, http_requests_error);
    }
    response
}
