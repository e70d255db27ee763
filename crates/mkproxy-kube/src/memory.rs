//! In-memory implementations of the cluster traits.
//!
//! Used by tests across the workspace in place of live clusters. Each fake
//! records the calls it receives so tests can assert on ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::error::{KubeError, KubeResult};
use crate::hub::{HubApi, RegistrationFeed};
use crate::review::AccessReviewer;
use crate::types::{
    AccessDecision, ClusterRegistration, LogRequest, RegistrationEvent, ResourceAttributes,
    Workload,
};
use crate::worker::{ConnectionConfig, LogStream, WorkerApi, WorkerConnector};

type FeedItem = KubeResult<RegistrationEvent>;

#[derive(Default)]
struct HubState {
    workloads: Vec<Workload>,
    registrations: Vec<ClusterRegistration>,
    malformed: Vec<(String, String)>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    feed: Option<mpsc::UnboundedSender<FeedItem>>,
    list_error: Option<KubeError>,
    watch_error: Option<KubeError>,
}

/// In-memory hub cluster.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    workload_lists: Arc<AtomicUsize>,
    registration_lists: Arc<AtomicUsize>,
    subscriptions: Arc<AtomicUsize>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HubState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn put_workload(&self, workload: Workload) {
        self.with_state(|s| {
            s.workloads
                .retain(|w| !(w.namespace == workload.namespace && w.name == workload.name));
            s.workloads.push(workload);
        });
    }

    pub fn put_registration(&self, registration: ClusterRegistration) {
        self.with_state(|s| {
            s.registrations.retain(|r| r.name != registration.name);
            s.malformed.retain(|(name, _)| *name != registration.name);
            s.registrations.push(registration);
        });
    }

    /// List a registration named `name` that fails to parse with `reason`.
    pub fn put_malformed_registration(&self, name: &str, reason: &str) {
        self.with_state(|s| {
            s.registrations.retain(|r| r.name != name);
            s.malformed.retain(|(n, _)| n != name);
            s.malformed.push((name.to_string(), reason.to_string()));
        });
    }

    pub fn remove_registration(&self, name: &str) {
        self.with_state(|s| {
            s.registrations.retain(|r| r.name != name);
            s.malformed.retain(|(n, _)| n != name);
        });
    }

    pub fn put_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.with_state(|s| {
            s.secrets
                .insert((namespace.to_string(), name.to_string()), data);
        });
    }

    /// Make every subsequent list call fail with `err` (`None` clears it).
    pub fn fail_lists(&self, err: Option<KubeError>) {
        self.with_state(|s| s.list_error = err);
    }

    /// Make every subsequent watch call fail with `err` (`None` clears it).
    pub fn fail_watches(&self, err: Option<KubeError>) {
        self.with_state(|s| s.watch_error = err);
    }

    /// Deliver an event to the current subscription. Returns false if no
    /// subscriber is listening.
    pub fn emit(&self, event: RegistrationEvent) -> bool {
        self.send_feed(Ok(event))
    }

    /// Fail the current subscription with `err`.
    pub fn emit_error(&self, err: KubeError) -> bool {
        self.send_feed(Err(err))
    }

    /// End the current subscription cleanly.
    pub fn close_feed(&self) {
        self.with_state(|s| s.feed = None);
    }

    fn send_feed(&self, item: FeedItem) -> bool {
        self.with_state(|s| match &s.feed {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        })
    }

    pub fn workload_list_calls(&self) -> usize {
        self.workload_lists.load(Ordering::SeqCst)
    }

    pub fn registration_list_calls(&self) -> usize {
        self.registration_lists.load(Ordering::SeqCst)
    }

    /// Number of successful `watch_cluster_registrations` calls so far.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HubApi for MemoryHub {
    async fn list_workloads(&self, namespace: &str) -> KubeResult<Vec<Workload>> {
        self.workload_lists.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if let Some(err) = &s.list_error {
                return Err(err.clone());
            }
            Ok(s.workloads
                .iter()
                .filter(|w| w.namespace == namespace)
                .cloned()
                .collect())
        })
    }

    async fn list_cluster_registrations(&self) -> KubeResult<Vec<KubeResult<ClusterRegistration>>> {
        self.registration_lists.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if let Some(err) = &s.list_error {
                return Err(err.clone());
            }
            let valid = s.registrations.iter().cloned().map(Ok);
            let malformed = s.malformed.iter().map(|(name, reason)| {
                Err(KubeError::InvalidObject {
                    name: name.clone(),
                    reason: reason.clone(),
                })
            });
            Ok(valid.chain(malformed).collect())
        })
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> KubeResult<Option<BTreeMap<String, Vec<u8>>>> {
        self.with_state(|s| {
            Ok(s.secrets
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        })
    }

    async fn watch_cluster_registrations(&self) -> KubeResult<RegistrationFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| match &s.watch_error {
            Some(err) => Err(err.clone()),
            None => {
                s.feed = Some(tx);
                Ok(())
            }
        })?;
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let feed = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(feed.boxed())
    }
}

/// Access reviewer with a fixed set of allowed tokens.
#[derive(Clone, Default)]
pub struct MemoryReviewer {
    allowed: Arc<Mutex<HashMap<String, bool>>>,
    reviews: Arc<Mutex<Vec<(String, ResourceAttributes)>>>,
    failure: Arc<Mutex<Option<KubeError>>>,
}

impl MemoryReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow every review for `token`.
    pub fn allow(&self, token: &str) -> &Self {
        self.allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), true);
        self
    }

    /// Deny every review for `token`.
    pub fn deny(&self, token: &str) -> &Self {
        self.allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), false);
        self
    }

    /// Make every review call fail.
    pub fn fail_with(&self, err: KubeError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// All reviews received, in order.
    pub fn reviews(&self) -> Vec<(String, ResourceAttributes)> {
        self.reviews.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AccessReviewer for MemoryReviewer {
    async fn review(&self, token: &str, attrs: &ResourceAttributes) -> KubeResult<AccessDecision> {
        self.reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((token.to_string(), attrs.clone()));

        if let Some(err) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(err);
        }

        let allowed = self
            .allowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied();
        Ok(match allowed {
            Some(true) => AccessDecision::allow(),
            Some(false) => AccessDecision::deny("denied by policy"),
            None => AccessDecision::deny("unknown token"),
        })
    }
}

#[derive(Default)]
struct WorkerState {
    task_runs: Option<serde_json::Value>,
    pods: Option<serde_json::Value>,
    pod: HashMap<String, serde_json::Value>,
    log_chunks: Vec<Bytes>,
    log_error: Option<KubeError>,
    follow_open: bool,
    failure: Option<KubeError>,
    log_requests: Vec<(String, LogRequest)>,
    selectors: Vec<String>,
}

/// In-memory worker cluster.
#[derive(Clone, Default)]
pub struct MemoryWorker {
    state: Arc<Mutex<WorkerState>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryWorker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut WorkerState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_task_runs(&self, list: serde_json::Value) {
        self.with_state(|s| s.task_runs = Some(list));
    }

    pub fn set_pods(&self, list: serde_json::Value) {
        self.with_state(|s| s.pods = Some(list));
    }

    pub fn put_pod(&self, name: &str, pod: serde_json::Value) {
        self.with_state(|s| {
            s.pod.insert(name.to_string(), pod);
        });
    }

    /// Chunks returned by every log request.
    pub fn set_logs(&self, chunks: Vec<Bytes>) {
        self.with_state(|s| s.log_chunks = chunks);
    }

    /// End every log body with `err` after the configured chunks.
    pub fn fail_logs_with(&self, err: Option<KubeError>) {
        self.with_state(|s| s.log_error = err);
    }

    /// Keep follow streams open after the configured chunks are sent.
    pub fn hold_follow_open(&self, open: bool) {
        self.with_state(|s| s.follow_open = open);
    }

    /// Make every call fail with `err` (`None` clears it).
    pub fn fail_with(&self, err: Option<KubeError>) {
        self.with_state(|s| s.failure = err);
    }

    /// Total calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Log requests received as `(pod, request)`.
    pub fn log_requests(&self) -> Vec<(String, LogRequest)> {
        self.with_state(|s| s.log_requests.clone())
    }

    /// Label selectors received by list calls.
    pub fn selectors(&self) -> Vec<String> {
        self.with_state(|s| s.selectors.clone())
    }

    fn begin(&self) -> KubeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| match &s.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        })
    }
}

fn empty_list() -> serde_json::Value {
    serde_json::json!({ "items": [] })
}

#[async_trait]
impl WorkerApi for MemoryWorker {
    async fn list_task_runs(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> KubeResult<serde_json::Value> {
        self.begin()?;
        Ok(self.with_state(|s| {
            s.selectors.push(selector.to_string());
            s.task_runs.clone().unwrap_or_else(empty_list)
        }))
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> KubeResult<serde_json::Value> {
        self.begin()?;
        Ok(self.with_state(|s| {
            s.selectors.push(selector.to_string());
            s.pods.clone().unwrap_or_else(empty_list)
        }))
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> KubeResult<serde_json::Value> {
        self.begin()?;
        self.with_state(|s| {
            s.pod.get(name).cloned().ok_or_else(|| KubeError::Api {
                code: 404,
                message: format!("pods \"{name}\" not found"),
            })
        })
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        request: &LogRequest,
    ) -> KubeResult<LogStream> {
        self.begin()?;
        let (chunks, log_error, hold_open) = self.with_state(|s| {
            s.log_requests.push((pod.to_string(), request.clone()));
            (s.log_chunks.clone(), s.log_error.clone(), s.follow_open && request.follow)
        });

        let body = stream::iter(chunks.into_iter().map(Ok));
        if let Some(err) = log_error {
            Ok(body.chain(stream::once(async move { Err(err) })).boxed())
        } else if hold_open {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}

/// Connector handing out registered `MemoryWorker`s by cluster name.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    workers: Arc<Mutex<HashMap<String, MemoryWorker>>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, cluster: &str, worker: MemoryWorker) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cluster.to_string(), worker);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerConnector for MemoryConnector {
    async fn connect(
        &self,
        cluster: &str,
        _config: &ConnectionConfig,
    ) -> KubeResult<Arc<dyn WorkerApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster)
            .cloned()
            .ok_or_else(|| KubeError::Request(format!("no worker for cluster {cluster}")))?;
        Ok(Arc::new(worker))
    }
}

/// A token-authenticated kubeconfig pointing at `server`, for tests.
pub fn test_kubeconfig(server: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: worker
  cluster:
    server: {server}
contexts:
- name: worker
  context:
    cluster: worker
    user: proxy
current-context: worker
users:
- name: proxy
  user:
    token: test-token
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_delivers_in_order() {
        let hub = MemoryHub::new();
        let mut feed = hub.watch_cluster_registrations().await.unwrap();

        assert!(hub.emit(RegistrationEvent::Added(ClusterRegistration::secret("a", "sa"))));
        assert!(hub.emit(RegistrationEvent::Deleted("a".into())));
        hub.close_feed();

        let events: Vec<_> = (&mut feed).map(|e| e.unwrap()).collect().await;
        assert_eq!(
            events,
            vec![
                RegistrationEvent::Added(ClusterRegistration::secret("a", "sa")),
                RegistrationEvent::Deleted("a".into()),
            ]
        );
        assert_eq!(hub.subscriptions(), 1);
    }

    #[tokio::test]
    async fn emit_without_subscriber_is_dropped() {
        let hub = MemoryHub::new();
        assert!(!hub.emit(RegistrationEvent::Deleted("a".into())));
    }

    #[tokio::test]
    async fn reviewer_records_and_decides() {
        let reviewer = MemoryReviewer::new();
        reviewer.allow("good").deny("bad");
        let attrs = ResourceAttributes::default();

        assert!(reviewer.review("good", &attrs).await.unwrap().allowed);
        assert!(!reviewer.review("bad", &attrs).await.unwrap().allowed);
        assert!(!reviewer.review("other", &attrs).await.unwrap().allowed);
        assert_eq!(reviewer.reviews().len(), 3);
    }
}
