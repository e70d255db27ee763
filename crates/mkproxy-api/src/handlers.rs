//! Route handlers.
//!
//! Each worker-backed handler runs the same pipeline under the request
//! timeout: validate, authorize, resolve, look up the connection config,
//! forward once. Successful worker responses carry `X-Worker-Cluster`.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use mkproxy_kube::{LogRequest, LogStream, WorkerApi};

use crate::authz::{job_access, log_access, pod_access};
use crate::config::WORKER_CLUSTER_HEADER;
use crate::error::ProxyError;
use crate::validate::{non_negative, optional_name, required_name, validate_name};
use crate::ProxyState;

/// The worker cluster serving an admitted job.
pub struct WorkerTarget {
    pub cluster: String,
    pub worker: Arc<dyn WorkerApi>,
}

/// Resolve `job` and connect to its worker cluster.
pub async fn admitted_target(
    state: &ProxyState,
    namespace: &str,
    job: &str,
) -> Result<WorkerTarget, ProxyError> {
    let assignment = state.resolver.resolve(namespace, job).await?;
    if !assignment.is_admitted() {
        return Err(ProxyError::NotAdmitted { job: job.to_string() });
    }
    let cluster = assignment.admitted_cluster().ok_or_else(|| {
        ProxyError::worker_unavailable("", "workload admitted without a cluster name")
    })?;

    let config = state
        .registry
        .get_connection(cluster)
        .await
        .ok_or_else(|| ProxyError::worker_unavailable(cluster, "no connection config registered"))?;
    let worker = state
        .connector
        .connect(cluster, &config)
        .await
        .map_err(|e| ProxyError::worker_unavailable(cluster, e.to_string()))?;

    debug!(namespace, job, cluster, "forwarding to worker cluster");
    Ok(WorkerTarget {
        cluster: cluster.to_string(),
        worker,
    })
}

/// Run `fut` under the unary request timeout.
pub async fn bounded<T>(
    state: &ProxyState,
    fut: impl Future<Output = Result<T, ProxyError>>,
) -> Result<T, ProxyError> {
    tokio::time::timeout(state.config.request_timeout, fut)
        .await
        .map_err(|_| ProxyError::Timeout)?
}

pub fn with_cluster(mut response: Response, cluster: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cluster) {
        response.headers_mut().insert(WORKER_CLUSTER_HEADER, value);
    }
    response
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> &'static str {
    "OK"
}

/// GET /ready
pub async fn ready(State(state): State<ProxyState>) -> impl IntoResponse {
    if state.registry.is_empty().await {
        (StatusCode::SERVICE_UNAVAILABLE, "No worker clusters configured")
    } else {
        (StatusCode::OK, "Ready")
    }
}

pub async fn not_found() -> ProxyError {
    ProxyError::RouteNotFound
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /api/v1/namespaces/:namespace/jobs/:job/resolve
pub async fn resolve_job(
    State(state): State<ProxyState>,
    Path((namespace, job)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    validate_name("job", &job)?;

    bounded(&state, async {
        state.authorizer.authorize(&headers, &job_access(&namespace, &job)).await?;
        let assignment = state.resolver.resolve(&namespace, &job).await?;

        let status = if assignment.is_admitted() {
            StatusCode::OK
        } else {
            StatusCode::CONFLICT
        };
        let response = (status, Json(&assignment)).into_response();
        Ok(match assignment.admitted_cluster() {
            Some(cluster) => with_cluster(response, cluster),
            None => response,
        })
    })
    .await
}

/// GET /api/v1/namespaces/:namespace/jobs/:job/taskruns
pub async fn list_task_runs(
    State(state): State<ProxyState>,
    Path((namespace, job)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    validate_name("job", &job)?;

    bounded(&state, async {
        state.authorizer.authorize(&headers, &job_access(&namespace, &job)).await?;
        let target = admitted_target(&state, &namespace, &job).await?;
        let list = target
            .worker
            .list_task_runs(&namespace, &state.config.job_selector(&job))
            .await
            .map_err(|e| ProxyError::upstream(&target.cluster, e))?;
        Ok(with_cluster(Json(list).into_response(), &target.cluster))
    })
    .await
}

/// GET /api/v1/namespaces/:namespace/jobs/:job/pods
pub async fn list_pods(
    State(state): State<ProxyState>,
    Path((namespace, job)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    validate_name("job", &job)?;

    bounded(&state, async {
        state.authorizer.authorize(&headers, &job_access(&namespace, &job)).await?;
        let target = admitted_target(&state, &namespace, &job).await?;
        let list = target
            .worker
            .list_pods(&namespace, &state.config.job_selector(&job))
            .await
            .map_err(|e| ProxyError::upstream(&target.cluster, e))?;
        Ok(with_cluster(Json(list).into_response(), &target.cluster))
    })
    .await
}

// ── Pods ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PodQuery {
    #[serde(alias = "pipelineRun")]
    pub job: Option<String>,
}

/// GET /api/v1/namespaces/:namespace/pods/:pod/status?job=
pub async fn pod_status(
    State(state): State<ProxyState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<PodQuery>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    validate_name("pod", &pod)?;
    let job = required_name("job", query.job.as_deref())?;

    bounded(&state, async {
        state.authorizer.authorize(&headers, &pod_access(&namespace, &pod)).await?;
        let target = admitted_target(&state, &namespace, job).await?;
        let body = target
            .worker
            .get_pod(&namespace, &pod)
            .await
            .map_err(|e| ProxyError::upstream(&target.cluster, e))?;
        Ok(with_cluster(Json(body).into_response(), &target.cluster))
    })
    .await
}

// ── Logs ───────────────────────────────────────────────────────

/// Raw log query. Numbers stay strings so a bad value is a 400 with our
/// own message.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(alias = "pipelineRun")]
    pub job: Option<String>,
    pub pod: Option<String>,
    pub container: Option<String>,
    pub tail_lines: Option<String>,
    pub since_seconds: Option<String>,
}

/// A validated log query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub job: String,
    pub pod: String,
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    /// `None` when absent or zero.
    pub since_seconds: Option<i64>,
}

impl LogTarget {
    pub fn parse(query: &LogQuery) -> Result<Self, ProxyError> {
        let job = required_name("job", query.job.as_deref())?;
        let pod = required_name("pod", query.pod.as_deref())?;
        let container = optional_name("container", query.container.as_deref())?;
        let tail_lines = non_negative("tailLines", query.tail_lines.as_deref())?;
        let since_seconds =
            non_negative("sinceSeconds", query.since_seconds.as_deref())?.filter(|s| *s > 0);
        Ok(Self {
            job: job.to_string(),
            pod: pod.to_string(),
            container: container.map(str::to_string),
            tail_lines,
            since_seconds,
        })
    }

    pub fn request(&self, follow: bool) -> LogRequest {
        LogRequest {
            container: self.container.clone(),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            follow,
        }
    }
}

/// GET /api/v1/namespaces/:namespace/logs?job=&pod=&container=&tailLines=&sinceSeconds=
///
/// The request timeout covers the whole body, not just the headers.
pub async fn fetch_logs(
    State(state): State<ProxyState>,
    Path(namespace): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    validate_name("namespace", &namespace)?;
    let target = LogTarget::parse(&query)?;
    let deadline = Instant::now() + state.config.request_timeout;

    let opened = tokio::time::timeout_at(deadline, async {
        state
            .authorizer
            .authorize(&headers, &log_access(&namespace, &target.pod))
            .await?;
        let worker = admitted_target(&state, &namespace, &target.job).await?;

        let mut request = target.request(false);
        request.tail_lines = request.tail_lines.or(Some(state.config.default_log_tail_lines));
        let upstream = worker
            .worker
            .pod_logs(&namespace, &target.pod, &request)
            .await
            .map_err(|e| ProxyError::upstream(&worker.cluster, e))?;
        Ok::<_, ProxyError>((worker.cluster, upstream))
    })
    .await
    .map_err(|_| ProxyError::Timeout)?;
    let (cluster, upstream) = opened?;

    let body = Body::from_stream(until_deadline(upstream, deadline, cluster.clone()));
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    Ok(with_cluster(response, &cluster))
}

/// Relay `upstream` verbatim, failing the body if `deadline` passes first.
fn until_deadline(
    upstream: LogStream,
    deadline: Instant,
    cluster: String,
) -> impl Stream<Item = io::Result<Bytes>> {
    stream::try_unfold((upstream, cluster), move |(mut upstream, cluster)| async move {
        match tokio::time::timeout_at(deadline, upstream.next()).await {
            Ok(Some(Ok(chunk))) => Ok(Some((chunk, (upstream, cluster)))),
            Ok(Some(Err(e))) => {
                warn!(%cluster, error = %e, "log body failed mid-stream");
                Err(io::Error::other(e))
            }
            Ok(None) => Ok(None),
            Err(_) => {
                warn!(%cluster, "log body exceeded request timeout");
                Err(io::Error::new(io::ErrorKind::TimedOut, "log fetch timed out"))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> LogQuery {
        let mut q = LogQuery::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "job" => q.job = v,
                "pod" => q.pod = v,
                "container" => q.container = v,
                "tailLines" => q.tail_lines = v,
                "sinceSeconds" => q.since_seconds = v,
                _ => unreachable!(),
            }
        }
        q
    }

    fn parse(pairs: &[(&str, &str)]) -> Result<LogTarget, ProxyError> {
        LogTarget::parse(&query(pairs))
    }

    #[test]
    fn log_target_requires_job_and_pod() {
        assert!(LogTarget::parse(&query(&[("pod", "p1")])).is_err());
        assert!(LogTarget::parse(&query(&[("job", "build-1")])).is_err());
        let t = LogTarget::parse(&query(&[("job", "build-1"), ("pod", "p1")])).unwrap();
        assert_eq!(t.container, None);
        assert_eq!(t.tail_lines, None);
    }

    #[test]
    fn zero_since_seconds_means_unfiltered() {
        let t = parse(&[("job", "j"), ("pod", "p"), ("sinceSeconds", "0")]).unwrap();
        assert_eq!(t.since_seconds, None);
        let t = parse(&[("job", "j"), ("pod", "p"), ("sinceSeconds", "60")]).unwrap();
        assert_eq!(t.since_seconds, Some(60));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = parse(&[("job", "j"), ("pod", "p"), ("tailLines", "abc")]).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
        let err = parse(&[("job", "j"), ("pod", "p"), ("sinceSeconds", "-5")]).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn request_carries_follow_flag() {
        let t = parse(&[("job", "j"), ("pod", "p"), ("container", "step-build")]).unwrap();
        let r = t.request(true);
        assert!(r.follow);
        assert_eq!(r.container.as_deref(), Some("step-build"));
    }

    #[tokio::test]
    async fn until_deadline_passes_bytes_through() {
        let chunks = vec![Ok(Bytes::from_static(b"a\n")), Ok(Bytes::from_static(b"b\n"))];
        let upstream: LogStream = stream::iter(chunks).boxed();
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let chunks: Vec<_> = until_deadline(upstream, deadline, "c1".into()).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn until_deadline_fails_stalled_body() {
        let upstream: LogStream = stream::iter(vec![Ok(Bytes::from_static(b"a\n"))])
            .chain(stream::pending())
            .boxed();
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let chunks: Vec<_> = until_deadline(upstream, deadline, "c1".into()).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].as_ref().unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
