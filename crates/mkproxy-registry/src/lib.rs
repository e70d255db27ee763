//! mkproxy-registry: worker cluster connection configs.
//!
//! ```text
//! MultiKueueCluster ──► ConfigLoader ──► staged set ──► ClusterConfigRegistry
//!   (hub)               secret + parse     (no lock)     (RwLock, write side)
//!        ▲
//!        └── RegistryWatcher: resync on start and on Added/Modified,
//!            remove on Deleted, resubscribe with backoff
//! ```

pub mod loader;
pub mod registry;
pub mod watcher;

pub use loader::{ConfigLoader, LoadError, RefreshStats, DEFAULT_SECRET_KEY};
pub use registry::ClusterConfigRegistry;
pub use watcher::{Backoff, RegistryWatcher};
