//! A clustered content-storage node with replica reconciliation

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod coordinator;
pub mod digest;
pub mod http;
pub mod metrics;
pub mod reconcile;
pub mod replica_set;
pub mod sched;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;
