//! mkproxy-api: the proxy's HTTP surface.
//!
//! Every request is handled on its own: authorize the caller for the exact
//! resource, resolve the job to its worker cluster, look up that cluster's
//! connection config, then forward. Nothing is cached between requests.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness |
//! | GET | `/ready` | 503 until a worker cluster is configured |
//! | GET | `/api/v1/namespaces/{ns}/jobs/{job}/resolve` | Job assignment |
//! | GET | `/api/v1/namespaces/{ns}/jobs/{job}/taskruns` | TaskRuns of the job |
//! | GET | `/api/v1/namespaces/{ns}/jobs/{job}/pods` | Pods of the job |
//! | GET | `/api/v1/namespaces/{ns}/pods/{pod}/status?job=` | One pod |
//! | GET | `/api/v1/namespaces/{ns}/logs?job=&pod=` | Bounded log fetch |
//! | GET | `/api/v1/namespaces/{ns}/logs/stream?job=&pod=` | Websocket log stream |

pub mod authz;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod validate;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use mkproxy_kube::{AccessReviewer, WorkerConnector};
use mkproxy_registry::ClusterConfigRegistry;
use mkproxy_resolver::JobResolver;

pub use authz::Authorizer;
pub use bridge::{relay, RelayOptions, RelayOutcome};
pub use config::{ProxyConfig, DEFAULT_JOB_LABEL, WORKER_CLUSTER_HEADER};
pub use error::ProxyError;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub resolver: Arc<JobResolver>,
    pub registry: Arc<ClusterConfigRegistry>,
    pub authorizer: Arc<Authorizer>,
    pub connector: Arc<dyn WorkerConnector>,
    pub config: Arc<ProxyConfig>,
}

impl ProxyState {
    pub fn new(
        resolver: JobResolver,
        registry: Arc<ClusterConfigRegistry>,
        reviewer: Arc<dyn AccessReviewer>,
        connector: Arc<dyn WorkerConnector>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            registry,
            authorizer: Arc::new(Authorizer::new(reviewer)),
            connector,
            config: Arc::new(config),
        }
    }
}

/// Build the complete router.
pub fn build_router(state: ProxyState) -> Router {
    let api_routes = Router::new()
        .route("/namespaces/{namespace}/jobs/{job}/resolve", get(handlers::resolve_job))
        .route("/namespaces/{namespace}/jobs/{job}/taskruns", get(handlers::list_task_runs))
        .route("/namespaces/{namespace}/jobs/{job}/pods", get(handlers::list_pods))
        .route("/namespaces/{namespace}/pods/{pod}/status", get(handlers::pod_status))
        .route("/namespaces/{namespace}/logs", get(handlers::fetch_logs))
        .route("/namespaces/{namespace}/logs/stream", get(bridge::stream_logs));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .fallback(handlers::not_found)
        .with_state(state)
}
