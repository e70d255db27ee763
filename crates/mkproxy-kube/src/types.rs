//! Domain records read from the hub and worker clusters.
//!
//! These are deliberately narrower than the upstream objects: only the
//! fields the proxy makes decisions on are carried.

use serde::{Deserialize, Serialize};

/// Location type of a MultiKueueCluster kubeconfig that we can load.
pub const SECRET_LOCATION_TYPE: &str = "Secret";

/// An owner reference on a hub object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// A Kueue Workload as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub owners: Vec<OwnerRef>,
    /// `status.admission` is set.
    pub admitted: bool,
    /// `status.clusterName`, when present.
    pub cluster_name: Option<String>,
    /// `status.nominatedClusterNames`.
    pub nominated_clusters: Vec<String>,
}

impl Workload {
    /// Whether this workload is owned by the object `kind/name`.
    pub fn is_owned_by(&self, kind: &str, name: &str) -> bool {
        self.owners.iter().any(|o| o.kind == kind && o.name == name)
    }
}

/// A MultiKueueCluster: a worker cluster name plus where its kubeconfig lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRegistration {
    pub name: String,
    pub location_type: String,
    pub location: String,
}

impl ClusterRegistration {
    pub fn new(name: &str, location_type: &str, location: &str) -> Self {
        Self {
            name: name.to_string(),
            location_type: location_type.to_string(),
            location: location.to_string(),
        }
    }

    /// Shorthand for a registration pointing at a secret.
    pub fn secret(name: &str, secret_name: &str) -> Self {
        Self::new(name, SECRET_LOCATION_TYPE, secret_name)
    }
}

/// One change notification for cluster registrations, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Added(ClusterRegistration),
    Modified(ClusterRegistration),
    /// Carries the name of the deleted registration.
    Deleted(String),
}

/// Attributes of a SelfSubjectAccessReview.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAttributes {
    pub namespace: String,
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: String,
}

impl ResourceAttributes {
    /// `resource` or `resource/subresource`, for log lines and messages.
    pub fn resource_path(&self) -> String {
        match &self.subresource {
            Some(sub) => format!("{}/{}", self.resource, sub),
            None => self.resource.clone(),
        }
    }
}

/// Outcome of an access review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Options for a pod log request on a worker cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    /// Keep the stream open until the container terminates.
    pub follow: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_match_requires_kind_and_name() {
        let wl = Workload {
            namespace: "ns".into(),
            name: "wl".into(),
            owners: vec![OwnerRef {
                kind: "PipelineRun".into(),
                name: "build-1".into(),
            }],
            admitted: false,
            cluster_name: None,
            nominated_clusters: vec![],
        };
        assert!(wl.is_owned_by("PipelineRun", "build-1"));
        assert!(!wl.is_owned_by("PipelineRun", "build-2"));
        assert!(!wl.is_owned_by("Job", "build-1"));
    }

    #[test]
    fn resource_path_with_subresource() {
        let attrs = ResourceAttributes {
            resource: "pods".into(),
            subresource: Some("log".into()),
            ..Default::default()
        };
        assert_eq!(attrs.resource_path(), "pods/log");
    }
}
