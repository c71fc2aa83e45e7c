//! Configuration for the node

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::HttpConfig;

const DEFAULT_METRICS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9119);

/// Node configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The public endpoint under which other replicas reach this node.
    ///
    /// Replica-set records name nodes by endpoint, so this must match what the
    /// membership feed publishes for this node. If unset, the endpoint is derived
    /// from the bound HTTP address, which is only useful for local development.
    pub endpoint: Option<Url>,
    /// Config for the HTTP server.
    pub http: HttpConfig,
    /// Config for the metrics server.
    ///
    /// The metrics server is started by default. To disable the metrics server, set to
    /// `Some(MetricsConfig::disabled())`.
    pub metrics: Option<MetricsConfig>,
    /// Config for the content store.
    pub store: StoreConfig,
    /// Config for reconciliation and sync jobs.
    pub sync: SyncConfig,
    /// Config for the worker pool and leader election.
    pub cluster: ClusterConfig,
}

/// The config for the metrics server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Set to true to disable the metrics server.
    pub disabled: bool,
    /// Optionally set a custom address to bind to.
    pub bind_addr: Option<SocketAddr>,
}

impl MetricsConfig {
    /// Disable the metrics server.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            bind_addr: None,
        }
    }
}

/// The config for the content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the index database and the blob files.
    ///
    /// If unset, a platform data directory is used (see [`Config::data_dir`]).
    pub path: Option<PathBuf>,
    /// Payloads larger than this are recorded in the clock log with the
    /// `skipped` flag and their bytes are not stored or replicated.
    pub max_file_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_file_size: 250_000_000,
        }
    }
}

/// The config for reconciliation sweeps, sync jobs and sync application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between reconciliation sweeps.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Spread a full pass over the user base across this many sweeps.
    ///
    /// Sweep `n` only considers users with `user_id % sweep_modulo == n % sweep_modulo`.
    pub sweep_modulo: u64,
    /// Maximum number of log entries served by a single export, and therefore
    /// the maximum batch size a sync job transfers at once.
    pub max_export_range: u64,
    /// Maximum number of sync jobs executing concurrently.
    pub max_concurrent_jobs: usize,
    /// Maximum number of sync jobs waiting in the queue.
    pub max_queue_len: usize,
    /// Number of retries before a job is marked failed-exhausted.
    pub max_retries: u32,
    /// Backoff before the first retry. Doubled per attempt.
    #[serde(with = "humantime_serde")]
    pub retry_initial_backoff: Duration,
    /// Upper bound for the retry backoff.
    #[serde(with = "humantime_serde")]
    pub retry_max_backoff: Duration,
    /// Timeout for a single replica-to-replica HTTP request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum number of out-of-order entries buffered per user on the apply side.
    pub gap_buffer_max_entries: usize,
    /// Maximum total bytes buffered per user on the apply side.
    pub gap_buffer_max_bytes: u64,
    /// Buffered entries older than this are dropped.
    #[serde(with = "humantime_serde")]
    pub gap_buffer_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            sweep_modulo: 1,
            max_export_range: 10_000,
            max_concurrent_jobs: 4,
            max_queue_len: 1024,
            max_retries: 5,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            gap_buffer_max_entries: 128,
            gap_buffer_max_bytes: 8 * 1024 * 1024,
            gap_buffer_max_age: Duration::from_secs(30),
        }
    }
}

/// The config for the worker pool and node-to-node authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of sync workers to spawn.
    pub workers: usize,
    /// Shared secret authorizing replica-to-replica requests.
    ///
    /// When set, `POST /sync-apply` requires it and gated content is only
    /// served to callers presenting it. If unset, nothing is enforced, which
    /// is only suitable for local development.
    pub sync_secret: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            sync_secret: None,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os("HOLDFAST_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().ok_or_else(|| {
                anyhow!("operating environment provides no directory for application data")
            })?;
            path.join("holdfast")
        };
        Ok(dir)
    }

    /// Get the directory for the store, from the config or the default data dir.
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Self::data_dir(),
        }
    }

    /// Get the address where the metrics server should be bound, if set.
    pub(crate) fn metrics_addr(&self) -> Option<SocketAddr> {
        match &self.metrics {
            None => Some(DEFAULT_METRICS_ADDR),
            Some(conf) => match conf.disabled {
                true => None,
                false => Some(conf.bind_addr.unwrap_or(DEFAULT_METRICS_ADDR)),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            http: HttpConfig {
                port: 8080,
                bind_addr: None,
            },
            metrics: None,
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}
