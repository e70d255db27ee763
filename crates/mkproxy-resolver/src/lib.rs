//! mkproxy-resolver: job to worker-cluster resolution.
//!
//! A job (PipelineRun) is linked to exactly one Kueue Workload through an
//! owner reference. The Workload's admission status says whether the job
//! has been dispatched to a worker cluster yet, and which one.
//!
//! Nothing is cached: every `resolve` lists the namespace's Workloads again,
//! so the answer always reflects the current admission state.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use mkproxy_kube::{HubApi, KubeError, Workload};

/// Owner kind linking a Workload to its job.
pub const DEFAULT_OWNER_KIND: &str = "PipelineRun";

/// Scheduling state of a job's assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssignmentState {
    Dispatching,
    Admitted,
}

/// A job's current assignment, serialized as the `/resolve` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Assigned worker cluster. Empty unless admitted.
    #[serde(rename = "name", skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    pub state: AssignmentState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nominated_clusters: Vec<String>,
    pub workload_name: String,
}

impl Assignment {
    pub fn is_admitted(&self) -> bool {
        self.state == AssignmentState::Admitted
    }

    /// The cluster name when admitted to a named cluster.
    ///
    /// `None` for `Dispatching` and for the upstream inconsistency of an
    /// admitted workload with an empty cluster name.
    pub fn admitted_cluster(&self) -> Option<&str> {
        (self.is_admitted() && !self.cluster.is_empty()).then_some(self.cluster.as_str())
    }

    fn from_workload(workload: &Workload) -> Self {
        if workload.admitted {
            Self {
                cluster: workload.cluster_name.clone().unwrap_or_default(),
                state: AssignmentState::Admitted,
                nominated_clusters: Vec::new(),
                workload_name: workload.name.clone(),
            }
        } else {
            Self {
                cluster: String::new(),
                state: AssignmentState::Dispatching,
                nominated_clusters: workload.nominated_clusters.clone(),
                workload_name: workload.name.clone(),
            }
        }
    }
}

/// Errors from job resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No Workload is owned by the job.
    #[error("no workload found for {namespace}/{job}")]
    NotFound { namespace: String, job: String },

    /// The hub could not be queried.
    #[error("failed to list workloads in {namespace}: {source}")]
    Transient {
        namespace: String,
        #[source]
        source: KubeError,
    },
}

/// Resolves jobs to their current Workload assignment.
pub struct JobResolver {
    hub: Arc<dyn HubApi>,
    owner_kind: String,
}

impl JobResolver {
    pub fn new(hub: Arc<dyn HubApi>) -> Self {
        Self {
            hub,
            owner_kind: DEFAULT_OWNER_KIND.to_string(),
        }
    }

    /// Match Workload owners of a different kind.
    pub fn with_owner_kind(mut self, kind: &str) -> Self {
        self.owner_kind = kind.to_string();
        self
    }

    /// Look up the job's assignment.
    ///
    /// Linear scan over the namespace's Workloads; the first one owned by
    /// the job wins.
    pub async fn resolve(&self, namespace: &str, job: &str) -> Result<Assignment, ResolveError> {
        let workloads = self
            .hub
            .list_workloads(namespace)
            .await
            .map_err(|source| ResolveError::Transient {
                namespace: namespace.to_string(),
                source,
            })?;

        let workload = workloads
            .iter()
            .find(|w| w.is_owned_by(&self.owner_kind, job))
            .ok_or_else(|| ResolveError::NotFound {
                namespace: namespace.to_string(),
                job: job.to_string(),
            })?;

        let assignment = Assignment::from_workload(workload);
        debug!(
            namespace,
            job,
            workload = %assignment.workload_name,
            state = ?assignment.state,
            cluster = %assignment.cluster,
            "resolved job assignment"
        );
        Ok(assignment)
    }
}
