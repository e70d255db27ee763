//! Full resync: registrations to parsed connection configs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use mkproxy_kube::{ClusterRegistration, ConnectionConfig, HubApi, KubeResult, SECRET_LOCATION_TYPE};

use crate::registry::ClusterConfigRegistry;

/// Secret key holding the serialized kubeconfig.
pub const DEFAULT_SECRET_KEY: &str = "kubeconfig";

/// Outcome of one full resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub loaded: usize,
    pub skipped: usize,
}

/// Why one cluster was left out of a resync.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unsupported location type {0:?}")]
    UnsupportedLocation(String),

    #[error("registration has no secret location")]
    EmptyLocation,

    #[error("secret {namespace}/{name} not found")]
    SecretMissing { namespace: String, name: String },

    #[error("secret {namespace}/{name} has no {key:?} key")]
    KeyMissing {
        namespace: String,
        name: String,
        key: String,
    },

    #[error(transparent)]
    Kube(#[from] mkproxy_kube::KubeError),
}

/// Reads registrations and their secrets from the hub.
pub struct ConfigLoader {
    hub: Arc<dyn HubApi>,
    secret_namespace: String,
    secret_key: String,
}

impl ConfigLoader {
    pub fn new(hub: Arc<dyn HubApi>, secret_namespace: &str) -> Self {
        Self {
            hub,
            secret_namespace: secret_namespace.to_string(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
        }
    }

    pub fn with_secret_key(mut self, key: &str) -> Self {
        self.secret_key = key.to_string();
        self
    }

    pub fn hub(&self) -> &Arc<dyn HubApi> {
        &self.hub
    }

    /// Build the staged set. A failing or malformed cluster is logged and
    /// omitted; only a failure to enumerate registrations aborts.
    pub async fn stage(&self) -> KubeResult<(HashMap<String, ConnectionConfig>, usize)> {
        let registrations = self.hub.list_cluster_registrations().await?;

        let mut staged = HashMap::with_capacity(registrations.len());
        let mut skipped = 0;
        for registration in registrations {
            let registration = match registration {
                Ok(registration) => registration,
                Err(e) => {
                    warn!(error = %e, "skipping malformed cluster registration");
                    skipped += 1;
                    continue;
                }
            };
            match self.load_one(&registration).await {
                Ok(config) => {
                    info!(
                        cluster = %registration.name,
                        endpoint = %config.endpoint(),
                        "loaded worker cluster config"
                    );
                    staged.insert(registration.name.clone(), config);
                }
                Err(LoadError::UnsupportedLocation(kind)) => {
                    warn!(
                        cluster = %registration.name,
                        location_type = %kind,
                        "skipping cluster with unsupported location type"
                    );
                    skipped += 1;
                }
                Err(e) => {
                    error!(
                        cluster = %registration.name,
                        error = %e,
                        "failed to load worker cluster config"
                    );
                    skipped += 1;
                }
            }
        }
        Ok((staged, skipped))
    }

    /// Stage and apply to `registry`.
    pub async fn resync(&self, registry: &ClusterConfigRegistry) -> KubeResult<RefreshStats> {
        let (staged, skipped) = self.stage().await?;
        let stats = RefreshStats {
            loaded: staged.len(),
            skipped,
        };
        registry.apply(staged).await;
        info!(loaded = stats.loaded, skipped = stats.skipped, "worker cluster resync complete");
        Ok(stats)
    }

    async fn load_one(
        &self,
        registration: &ClusterRegistration,
    ) -> Result<ConnectionConfig, LoadError> {
        if registration.location_type != SECRET_LOCATION_TYPE {
            return Err(LoadError::UnsupportedLocation(registration.location_type.clone()));
        }
        if registration.location.is_empty() {
            return Err(LoadError::EmptyLocation);
        }

        let name = &registration.location;
        let data = self
            .hub
            .get_secret_data(&self.secret_namespace, name)
            .await?
            .ok_or_else(|| LoadError::SecretMissing {
                namespace: self.secret_namespace.clone(),
                name: name.clone(),
            })?;
        let payload = data.get(&self.secret_key).ok_or_else(|| LoadError::KeyMissing {
            namespace: self.secret_namespace.clone(),
            name: name.clone(),
            key: self.secret_key.clone(),
        })?;

        Ok(ConnectionConfig::from_kubeconfig(payload).await?)
    }
}
