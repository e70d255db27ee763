//! Worker cluster access: connection configs, TaskRuns, Pods and logs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::io::AsyncReadExt;
use futures_util::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::error::{KubeError, KubeResult};
use crate::types::LogRequest;

/// Bytes read per upstream log chunk.
const LOG_READ_CHUNK: usize = 4096;

/// A pod log body, one item per chunk read from the worker.
pub type LogStream = BoxStream<'static, KubeResult<Bytes>>;

/// Parsed endpoint and credentials for one worker cluster.
#[derive(Clone)]
pub struct ConnectionConfig {
    config: Config,
}

impl ConnectionConfig {
    /// Parse a serialized kubeconfig.
    pub async fn from_kubeconfig(data: &[u8]) -> KubeResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| KubeError::Kubeconfig(format!("not utf-8: {e}")))?;
        let kubeconfig =
            Kubeconfig::from_yaml(text).map_err(|e| KubeError::Kubeconfig(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| KubeError::Kubeconfig(e.to_string()))?;
        Ok(Self { config })
    }

    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// API server URL of the worker.
    pub fn endpoint(&self) -> String {
        self.config.cluster_url.to_string()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}

/// Calls against one worker cluster.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn list_task_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> KubeResult<serde_json::Value>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> KubeResult<serde_json::Value>;

    async fn get_pod(&self, namespace: &str, name: &str) -> KubeResult<serde_json::Value>;

    /// Open a log body. With `follow` the stream stays open until the
    /// container terminates.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        request: &LogRequest,
    ) -> KubeResult<LogStream>;
}

/// Builds a `WorkerApi` for a cluster from its connection config.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    async fn connect(
        &self,
        cluster: &str,
        config: &ConnectionConfig,
    ) -> KubeResult<Arc<dyn WorkerApi>>;
}

/// Connector producing kube-rs backed workers.
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

#[async_trait]
impl WorkerConnector for KubeConnector {
    async fn connect(
        &self,
        cluster: &str,
        config: &ConnectionConfig,
    ) -> KubeResult<Arc<dyn WorkerApi>> {
        let client = Client::try_from(config.config().clone())?;
        debug!(cluster, endpoint = %config.endpoint(), "worker client built");
        Ok(Arc::new(KubeWorker::new(client)))
    }
}

/// `WorkerApi` backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeWorker {
    client: Client,
    task_runs: ApiResource,
}

impl KubeWorker {
    pub fn new(client: Client) -> Self {
        let task_runs = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("tekton.dev", "v1", "TaskRun"),
            "taskruns",
        );
        Self { client, task_runs }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkerApi for KubeWorker {
    async fn list_task_runs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> KubeResult<serde_json::Value> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.task_runs);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        to_json(&list)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> KubeResult<serde_json::Value> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        to_json(&list)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> KubeResult<serde_json::Value> {
        let pod = self.pods(namespace).get(name).await?;
        to_json(&pod)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        request: &LogRequest,
    ) -> KubeResult<LogStream> {
        let params = LogParams {
            container: request.container.clone(),
            follow: request.follow,
            tail_lines: request.tail_lines,
            since_seconds: request.since_seconds,
            ..LogParams::default()
        };
        let reader = self.pods(namespace).log_stream(pod, &params).await?;
        Ok(chunked(reader))
    }
}

/// Turn an async reader into a stream of at most `LOG_READ_CHUNK` sized chunks.
fn chunked<R>(reader: R) -> LogStream
where
    R: futures_util::io::AsyncRead + Send + 'static,
{
    stream::try_unfold(Box::pin(reader), |mut reader| async move {
        let mut buf = vec![0u8; LOG_READ_CHUNK];
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| KubeError::Stream(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), reader)))
    })
    .boxed()
}

fn to_json<T: serde::Serialize>(value: &T) -> KubeResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| KubeError::Request(format!("encode response: {e}")))
}
