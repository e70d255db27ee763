//! The connection config cache.
//!
//! Maps worker cluster names to parsed `ConnectionConfig`s. A single
//! reader/writer lock guards the map:
//!
//! - `get_connection`, `list_cluster_names`, `is_empty` take the read side
//!   and only hold it long enough to clone an `Arc` or the key set.
//! - `apply` and `remove` take the write side. Configs are parsed before
//!   `apply` is called, so the write side is never held across I/O.
//!
//! An entry is always either absent, its previous value, or a fully parsed
//! new value. Entries are independent; nothing guarantees readers see all
//! entries of one refresh at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use mkproxy_kube::ConnectionConfig;

/// Worker cluster name to connection config.
#[derive(Default)]
pub struct ClusterConfigRegistry {
    entries: RwLock<HashMap<String, Arc<ConnectionConfig>>>,
}

impl ClusterConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection config for a cluster, if loaded.
    pub async fn get_connection(&self, cluster: &str) -> Option<Arc<ConnectionConfig>> {
        let entries = self.entries.read().await;
        entries.get(cluster).cloned()
    }

    /// Names of all loaded clusters.
    pub async fn list_cluster_names(&self) -> BTreeSet<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Insert or replace every staged entry. Entries absent from `staged`
    /// are left untouched.
    pub async fn apply(&self, staged: HashMap<String, ConnectionConfig>) {
        let mut entries = self.entries.write().await;
        for (cluster, config) in staged {
            debug!(%cluster, endpoint = %config.endpoint(), "worker config stored");
            entries.insert(cluster, Arc::new(config));
        }
    }

    /// Remove exactly one entry. Returns whether it existed.
    pub async fn remove(&self, cluster: &str) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(cluster).is_some();
        if removed {
            info!(%cluster, "removed worker config");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str) -> ConnectionConfig {
        ConnectionConfig::from_config(kube::Config::new(server.parse().unwrap()))
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_cluster() {
        let registry = ClusterConfigRegistry::new();
        assert!(registry.get_connection("nope").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn apply_inserts_and_replaces() {
        let registry = ClusterConfigRegistry::new();
        registry.apply(HashMap::from([("c1".to_string(), config("https://old.example"))])).await;

        let mut staged = HashMap::new();
        staged.insert("c1".to_string(), config("https://new.example"));
        staged.insert("c2".to_string(), config("https://c2.example"));
        registry.apply(staged).await;

        let c1 = registry.get_connection("c1").await.unwrap();
        assert!(c1.endpoint().contains("new.example"));
        assert_eq!(
            registry.list_cluster_names().await,
            BTreeSet::from(["c1".to_string(), "c2".to_string()])
        );
    }

    #[tokio::test]
    async fn apply_keeps_entries_missing_from_stage() {
        let registry = ClusterConfigRegistry::new();
        registry.apply(HashMap::from([("c1".to_string(), config("https://c1.example"))])).await;

        let mut staged = HashMap::new();
        staged.insert("c2".to_string(), config("https://c2.example"));
        registry.apply(staged).await;

        assert!(registry.get_connection("c1").await.is_some());
    }

    #[tokio::test]
    async fn remove_touches_only_named_entry() {
        let registry = ClusterConfigRegistry::new();
        registry.apply(HashMap::from([("c1".to_string(), config("https://c1.example"))])).await;
        registry.apply(HashMap::from([("c2".to_string(), config("https://c2.example"))])).await;

        assert!(registry.remove("c1").await);
        assert!(!registry.remove("c1").await);
        assert!(registry.get_connection("c1").await.is_none());
        assert!(registry.get_connection("c2").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_see_old_or_new_value_during_writes() {
        let registry = Arc::new(ClusterConfigRegistry::new());
        registry.apply(HashMap::from([("c1".to_string(), config("https://v0.example"))])).await;

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 1..=200 {
                    let mut staged = HashMap::new();
                    staged.insert("c1".to_string(), config(&format!("https://v{i}.example")));
                    registry.apply(staged).await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let entry = registry.get_connection("c1").await.unwrap();
                    let endpoint = entry.endpoint();
                    let version: u32 = endpoint
                        .trim_start_matches("https://v")
                        .trim_end_matches('/')
                        .trim_end_matches(".example")
                        .parse()
                        .unwrap();
                    assert!(version <= 200);
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
        let last = registry.get_connection("c1").await.unwrap();
        assert!(last.endpoint().contains("v200.example"));
    }
}
