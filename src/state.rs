//! Shared state for the holdfast node

use url::Url;

use crate::{
    coordinator::Coordinator, reconcile::DivergenceSet, sched::Scheduler, store::Store,
    sync::apply::Applier,
};

/// The shared app state.
#[derive(Clone)]
pub struct AppState {
    /// The content store and clock log.
    pub store: Store,
    /// Ingests sync batches pushed by primaries.
    pub applier: Applier,
    /// Handle to the sync job queue.
    pub scheduler: Scheduler,
    /// Handle to worker coordination and leader election.
    pub coordinator: Coordinator,
    /// Replica pairs flagged by the reconciler.
    pub diverged: DivergenceSet,
    /// The endpoint under which other replicas address this node.
    pub me: Url,
    /// Shared secret for replica-to-replica requests, if configured.
    pub sync_secret: Option<String>,
    /// Server-side cap on entries per export.
    pub max_export: u64,
}
