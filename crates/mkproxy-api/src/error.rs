//! Router error types and their HTTP mapping.

use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use mkproxy_kube::KubeError;
use mkproxy_resolver::ResolveError;

use crate::config::WORKER_CLUSTER_HEADER;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing bearer token")]
    MissingCredential,

    #[error("credentials rejected by the hub")]
    Unauthenticated,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("no workload found for {namespace}/{job}")]
    JobNotFound { namespace: String, job: String },

    #[error("job {job} is not admitted to a worker cluster")]
    NotAdmitted { job: String },

    #[error("worker cluster {cluster:?} unavailable: {reason}")]
    WorkerUnavailable { cluster: String, reason: String },

    #[error("hub request failed: {0}")]
    Hub(#[source] KubeError),

    #[error("worker cluster {cluster} request failed: {source}")]
    Upstream {
        cluster: String,
        #[source]
        source: KubeError,
    },

    #[error("request timed out")]
    Timeout,

    #[error("not found")]
    RouteNotFound,
}

impl ProxyError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::MissingCredential | Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::JobNotFound { .. } | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::NotAdmitted { .. } => StatusCode::CONFLICT,
            Self::WorkerUnavailable { .. } => StatusCode::FAILED_DEPENDENCY,
            Self::Hub(_) | Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Cluster the failure is attributed to, if one was resolved.
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Self::WorkerUnavailable { cluster, .. } | Self::Upstream { cluster, .. } => {
                (!cluster.is_empty()).then_some(cluster.as_str())
            }
            _ => None,
        }
    }

    pub fn upstream(cluster: &str, source: KubeError) -> Self {
        Self::Upstream {
            cluster: cluster.to_string(),
            source,
        }
    }

    pub fn worker_unavailable(cluster: &str, reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            cluster: cluster.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ResolveError> for ProxyError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound { namespace, job } => Self::JobNotFound { namespace, job },
            ResolveError::Transient { source, .. } => Self::Hub(source),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        let cluster = self.cluster().and_then(|c| HeaderValue::from_str(c).ok());
        let mut response = (status, self.to_string()).into_response();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if let Some(cluster) = cluster {
            headers.insert(WORKER_CLUSTER_HEADER, cluster);
        }
        response
    }
}
