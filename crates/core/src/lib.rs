//! zrebase core library.
//!
//! This crate reconciles a destination tree of ZFS boot-environment datasets
//! with its source lineage: inventory of both roots, classification of
//! destination branches, transfer range resolution, and the reversible rebase
//! sequence (backup rename, bootstrap snapshot, incremental send/receive).

pub mod backend;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod inventory;
pub mod models;
pub mod naming;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod zfs;

// Re-exports for convenience.
pub use backend::{DryRunBackend, MemoryBackend, StorageBackend};
pub use config::AppConfig;
pub use controller::{Reconciler, RunMode};
pub use report::RunReport;
pub use zfs::ZfsBackend;
