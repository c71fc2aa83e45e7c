//! The main server which combines the HTTP API, the worker pool and the
//! coordinator.

use anyhow::Result;
use iroh_metrics::metrics::start_metrics_server;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::{
    config::Config,
    coordinator::Coordinator,
    http::{self, HttpServer},
    reconcile::{DivergenceSet, Reconciler},
    sched::{Scheduler, Worker},
    state::AppState,
    store::{Store, StoreOptions},
    sync::{apply::Applier, transfer::SyncClient},
};

/// Terminal job outcomes in flight between the scheduler and the
/// coordinator.
const EVENTS_CAPACITY: usize = 64;

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let store = Store::open(
        config.store_dir()?,
        StoreOptions {
            max_file_size: config.store.max_file_size,
        },
    )?;
    let server = Server::spawn(config, store).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The holdfast node.
pub struct Server {
    http_server: HttpServer,
    shutdown: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
    events_task: tokio::task::JoinHandle<()>,
    metrics_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This binds the HTTP listener, then spawns the coordinator, the sync
    /// job scheduler, the worker pool and the HTTP server task. One worker
    /// is elected leader and runs the reconciliation loop.
    pub async fn spawn(config: Config, store: Store) -> Result<Self> {
        let listener = http::bind(&config.http).await?;
        let me: Url = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("http://{}", listener.local_addr()?).parse()?,
        };
        info!(%me, "node endpoint");

        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::spawn(shutdown.clone());
        let (events_tx, mut events_rx) = mpsc::channel(EVENTS_CAPACITY);
        let (scheduler, work_rx) = Scheduler::spawn(&config.sync, events_tx, shutdown.clone());

        // route terminal job outcomes to whichever worker currently leads
        let events_task = tokio::task::spawn({
            let coordinator = coordinator.clone();
            async move {
                while let Some(outcome) = events_rx.recv().await {
                    coordinator.job_completed(outcome).await;
                }
            }
        });

        let applier = Applier::new(store.clone(), &config.sync);
        let client = SyncClient::new(&config.sync, config.cluster.sync_secret.clone())?;
        let diverged = DivergenceSet::default();
        let reconciler = Reconciler::new(
            store.clone(),
            client.clone(),
            scheduler.clone(),
            coordinator.clone(),
            me.clone(),
            config.sync.clone(),
            diverged.clone(),
        );

        let mut workers = Vec::with_capacity(config.cluster.workers);
        for _ in 0..config.cluster.workers.max(1) {
            let (id, leadership) = coordinator.register().await?;
            let worker = Worker::new(
                id,
                leadership,
                &scheduler,
                work_rx.clone(),
                store.clone(),
                client.clone(),
                me.clone(),
                &config.sync,
                reconciler.clone(),
                shutdown.clone(),
            );
            workers.push(worker.spawn());
        }

        let state = AppState {
            store,
            applier,
            scheduler,
            coordinator,
            diverged,
            me,
            sync_secret: config.cluster.sync_secret.clone(),
            max_export: config.sync.max_export_range,
        };

        let metrics_addr = config.metrics_addr();
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                start_metrics_server(addr).await?;
            }
            Ok(())
        });
        let http_server = HttpServer::spawn(listener, state)?;
        Ok(Self {
            http_server,
            shutdown,
            workers,
            events_task,
            metrics_task,
        })
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        self.shutdown.cancel();
        for worker in self.workers {
            worker.await?;
        }
        self.events_task.await?;
        self.http_server.shutdown().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails, or [`Self::shutdown`] is called.
    pub async fn run_until_error(self) -> Result<()> {
        let res = self.http_server.run_until_done().await;
        self.metrics_task.abort();
        self.shutdown.cancel();
        res
    }

    /// The address the HTTP server is bound to.
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_server.addr()
    }

    /// Spawn a server suitable for testing.
    ///
    /// Binds to a random localhost port, stores in a temp dir, sweeps fast
    /// and disables the metrics server. Returns the server handle, the temp
    /// dir guard and the node's endpoint [`Url`].
    #[cfg(test)]
    pub(crate) async fn spawn_for_tests() -> Result<(Self, tempfile::TempDir, Url)> {
        let mut config = Config::default();
        config.sync.sweep_interval = std::time::Duration::from_millis(100);
        config.sync.retry_initial_backoff = std::time::Duration::from_millis(50);
        Self::spawn_for_tests_with(config).await
    }

    /// Like [`Self::spawn_for_tests`], but with a caller-provided config.
    /// The bind address, store path and metrics server are still overridden.
    #[cfg(test)]
    pub(crate) async fn spawn_for_tests_with(
        mut config: Config,
    ) -> Result<(Self, tempfile::TempDir, Url)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::config::MetricsConfig;

        config.http.port = 0;
        config.http.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.metrics = Some(MetricsConfig::disabled());

        let dir = tempfile::tempdir()?;
        let store = Store::open(
            dir.path(),
            StoreOptions {
                max_file_size: config.store.max_file_size,
            },
        )?;
        let server = Self::spawn(config, store).await?;
        let url = format!("http://{}", server.http_addr()).parse()?;
        Ok((server, dir, url))
    }
}
