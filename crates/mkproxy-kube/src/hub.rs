//! Hub cluster access: Workloads, MultiKueueClusters and their Secrets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchEvent, WatchParams,
};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{KubeError, KubeResult};
use crate::types::{
    ClusterRegistration, OwnerRef, RegistrationEvent, Workload, SECRET_LOCATION_TYPE,
};

/// Continuous feed of registration changes. Ends when the subscription does.
pub type RegistrationFeed = BoxStream<'static, KubeResult<RegistrationEvent>>;

/// Read access to the hub cluster.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// All Workloads in a namespace. Objects that do not parse are left out.
    async fn list_workloads(&self, namespace: &str) -> KubeResult<Vec<Workload>>;

    /// All cluster registrations, one entry per object. An object that
    /// does not parse is an `Err` for that entry alone.
    async fn list_cluster_registrations(&self) -> KubeResult<Vec<KubeResult<ClusterRegistration>>>;

    /// The data map of a Secret, or `None` if the secret does not exist.
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> KubeResult<Option<BTreeMap<String, Vec<u8>>>>;

    /// Subscribe to registration changes.
    async fn watch_cluster_registrations(&self) -> KubeResult<RegistrationFeed>;
}

/// `HubApi` backed by a kube-rs client.
///
/// Watches resume from the resourceVersion of the last registration list
/// or event, so a routine server-side watch timeout does not replay every
/// registration as Added.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    workloads: ApiResource,
    clusters: ApiResource,
    registration_version: Arc<Mutex<Option<String>>>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        let workloads = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("kueue.x-k8s.io", "v1beta1", "Workload"),
            "workloads",
        );
        let clusters = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("kueue.x-k8s.io", "v1beta1", "MultiKueueCluster"),
            "multikueueclusters",
        );
        Self {
            client,
            workloads,
            clusters,
            registration_version: Arc::default(),
        }
    }

    fn cluster_api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.clusters)
    }

    fn watch_version(&self) -> String {
        self.registration_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "0".to_string())
    }
}

#[async_trait]
impl HubApi for KubeHub {
    async fn list_workloads(&self, namespace: &str) -> KubeResult<Vec<Workload>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.workloads);
        let list = api.list(&ListParams::default()).await?;
        debug!(namespace, count = list.items.len(), "listed workloads");
        Ok(workloads_from_objects(&list.items))
    }

    async fn list_cluster_registrations(&self) -> KubeResult<Vec<KubeResult<ClusterRegistration>>> {
        let list = self.cluster_api().list(&ListParams::default()).await?;
        remember_version(&self.registration_version, list.metadata.resource_version);
        Ok(list.items.iter().map(registration_from_object).collect())
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> KubeResult<Option<BTreeMap<String, Vec<u8>>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        Ok(Some(data))
    }

    async fn watch_cluster_registrations(&self) -> KubeResult<RegistrationFeed> {
        let version = self.watch_version();
        debug!(resource_version = %version, "watching cluster registrations");
        let stream = self
            .cluster_api()
            .watch(&WatchParams::default(), &version)
            .await?;

        let seen = self.registration_version.clone();
        let feed = stream.filter_map(move |item| future::ready(registration_event(item, &seen)));
        Ok(feed.boxed())
    }
}

/// Convert listed Workloads, logging and leaving out any that do not parse.
pub fn workloads_from_objects(objects: &[DynamicObject]) -> Vec<Workload> {
    objects
        .iter()
        .filter_map(|obj| match workload_from_object(obj) {
            Ok(workload) => Some(workload),
            Err(e) => {
                warn!(
                    namespace = %obj.namespace().unwrap_or_default(),
                    workload = %obj.name_any(),
                    error = %e,
                    "skipping malformed workload"
                );
                None
            }
        })
        .collect()
}

/// Map one watch item to a feed item, tracking the resourceVersion in
/// `seen`. Objects that do not parse are logged and dropped, so they never
/// end the subscription.
fn registration_event(
    item: Result<WatchEvent<DynamicObject>, kube::Error>,
    seen: &Mutex<Option<String>>,
) -> Option<KubeResult<RegistrationEvent>> {
    let event = match item {
        Ok(event) => event,
        Err(e) => return Some(Err(KubeError::from(e))),
    };
    match event {
        WatchEvent::Added(obj) => {
            remember_version(seen, obj.resource_version());
            parsed_registration(&obj).map(|r| Ok(RegistrationEvent::Added(r)))
        }
        WatchEvent::Modified(obj) => {
            remember_version(seen, obj.resource_version());
            parsed_registration(&obj).map(|r| Ok(RegistrationEvent::Modified(r)))
        }
        WatchEvent::Deleted(obj) => {
            remember_version(seen, obj.resource_version());
            Some(Ok(RegistrationEvent::Deleted(obj.name_any())))
        }
        WatchEvent::Bookmark(bookmark) => {
            remember_version(seen, Some(bookmark.metadata.resource_version));
            None
        }
        WatchEvent::Error(resp) => {
            if resp.code == 410 {
                // Expired version: the next watch starts from a fresh list.
                *seen.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }
            Some(Err(KubeError::Api {
                code: resp.code,
                message: resp.message,
            }))
        }
    }
}

fn parsed_registration(obj: &DynamicObject) -> Option<ClusterRegistration> {
    match registration_from_object(obj) {
        Ok(registration) => Some(registration),
        Err(e) => {
            warn!(cluster = %obj.name_any(), error = %e, "dropping malformed registration event");
            None
        }
    }
}

fn remember_version(seen: &Mutex<Option<String>>, version: Option<String>) {
    if let Some(version) = version.filter(|v| !v.is_empty()) {
        *seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(version);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkloadStatusFields {
    #[serde(default)]
    admission: Option<serde_json::Value>,
    #[serde(default)]
    cluster_name: Option<String>,
    #[serde(default)]
    nominated_cluster_names: Vec<String>,
}

/// Convert a dynamic Workload object into a `Workload`.
pub fn workload_from_object(obj: &DynamicObject) -> KubeResult<Workload> {
    let name = obj.name_any();
    let status: WorkloadStatusFields = match obj.data.get("status") {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|e| KubeError::InvalidObject {
                name: name.clone(),
                reason: format!("status: {e}"),
            })?,
        _ => WorkloadStatusFields::default(),
    };

    let owners = obj
        .owner_references()
        .iter()
        .map(|o| OwnerRef {
            kind: o.kind.clone(),
            name: o.name.clone(),
        })
        .collect();

    Ok(Workload {
        namespace: obj.namespace().unwrap_or_default(),
        name,
        owners,
        admitted: status.admission.is_some_and(|a| !a.is_null()),
        cluster_name: status.cluster_name,
        nominated_clusters: status.nominated_cluster_names,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeConfigRef {
    #[serde(default)]
    location_type: Option<String>,
    #[serde(default)]
    location: String,
}

/// Convert a dynamic MultiKueueCluster object into a `ClusterRegistration`.
///
/// A missing `locationType` is read as `Secret`, the CRD default.
pub fn registration_from_object(obj: &DynamicObject) -> KubeResult<ClusterRegistration> {
    let name = obj.name_any();
    let kube_config: KubeConfigRef = match obj.data.pointer("/spec/kubeConfig") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| KubeError::InvalidObject {
            name: name.clone(),
            reason: format!("spec.kubeConfig: {e}"),
        })?,
        None => KubeConfigRef::default(),
    };

    Ok(ClusterRegistration {
        name,
        location_type: kube_config
            .location_type
            .unwrap_or_else(|| SECRET_LOCATION_TYPE.to_string()),
        location: kube_config.location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canned::{object_list, watch_event, CannedApi};
    use serde_json::json;

    fn object(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn admitted_workload_with_cluster() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": {
                "name": "pipelinerun-build-1-abcde",
                "namespace": "team-a",
                "ownerReferences": [{
                    "apiVersion": "tekton.dev/v1",
                    "kind": "PipelineRun",
                    "name": "build-1",
                    "uid": "1234"
                }]
            },
            "status": {
                "admission": { "clusterQueue": "cq" },
                "clusterName": "worker-east"
            }
        }));

        let wl = workload_from_object(&obj).unwrap();
        assert_eq!(wl.namespace, "team-a");
        assert!(wl.admitted);
        assert_eq!(wl.cluster_name.as_deref(), Some("worker-east"));
        assert!(wl.is_owned_by("PipelineRun", "build-1"));
    }

    #[test]
    fn pending_workload_keeps_nominations() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": { "name": "wl", "namespace": "ns" },
            "status": { "nominatedClusterNames": ["c1", "c2"] }
        }));

        let wl = workload_from_object(&obj).unwrap();
        assert!(!wl.admitted);
        assert_eq!(wl.cluster_name, None);
        assert_eq!(wl.nominated_clusters, vec!["c1", "c2"]);
    }

    #[test]
    fn workload_without_status_is_pending() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": { "name": "wl", "namespace": "ns" }
        }));

        let wl = workload_from_object(&obj).unwrap();
        assert!(!wl.admitted);
        assert!(wl.owners.is_empty());
    }

    #[test]
    fn null_admission_is_not_admitted() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": { "name": "wl", "namespace": "ns" },
            "status": { "admission": null }
        }));

        assert!(!workload_from_object(&obj).unwrap().admitted);
    }

    #[test]
    fn malformed_status_is_rejected() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": { "name": "wl", "namespace": "ns" },
            "status": { "clusterName": 42 }
        }));

        let err = workload_from_object(&obj).unwrap_err();
        assert!(matches!(err, KubeError::InvalidObject { .. }));
    }

    #[test]
    fn registration_reads_kubeconfig_location() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "MultiKueueCluster",
            "metadata": { "name": "worker-east" },
            "spec": { "kubeConfig": { "locationType": "Secret", "location": "east-kubeconfig" } }
        }));

        let reg = registration_from_object(&obj).unwrap();
        assert_eq!(reg, ClusterRegistration::secret("worker-east", "east-kubeconfig"));
    }

    #[test]
    fn registration_defaults_location_type() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "MultiKueueCluster",
            "metadata": { "name": "worker-west" },
            "spec": { "kubeConfig": { "location": "west-kubeconfig" } }
        }));

        let reg = registration_from_object(&obj).unwrap();
        assert_eq!(reg.location_type, SECRET_LOCATION_TYPE);
    }

    #[test]
    fn registration_keeps_unsupported_location_type() {
        let obj = object(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "MultiKueueCluster",
            "metadata": { "name": "worker-path" },
            "spec": { "kubeConfig": { "locationType": "Path", "location": "/etc/kube" } }
        }));

        let reg = registration_from_object(&obj).unwrap();
        assert_eq!(reg.location_type, "Path");
    }

    const CLUSTERS_PATH: &str = "/apis/kueue.x-k8s.io/v1beta1/multikueueclusters";

    fn cluster(name: &str, location: serde_json::Value, version: &str) -> serde_json::Value {
        json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "MultiKueueCluster",
            "metadata": { "name": name, "resourceVersion": version },
            "spec": { "kubeConfig": { "locationType": "Secret", "location": location } }
        })
    }

    fn workload(name: &str, owner: &str, status: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": {
                "name": name,
                "namespace": "team-a",
                "ownerReferences": [{
                    "apiVersion": "tekton.dev/v1",
                    "kind": "PipelineRun",
                    "name": owner,
                    "uid": format!("uid-{owner}")
                }]
            },
            "status": status
        })
    }

    #[test]
    fn malformed_workload_is_left_out_of_the_list() {
        let objects = vec![
            object(workload("wl-bad", "build-1", json!({ "clusterName": 42 }))),
            object(workload("wl-good", "build-2", json!({ "admission": {}, "clusterName": "c1" }))),
        ];

        let workloads = workloads_from_objects(&objects);
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].name, "wl-good");
    }

    #[test]
    fn malformed_registration_event_is_dropped() {
        let seen = Mutex::new(None);
        let broken = object(cluster("broken", json!(42), "7"));
        assert!(registration_event(Ok(WatchEvent::Added(broken)), &seen).is_none());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("7"));

        let good = object(cluster("good", json!("good-kubeconfig"), "8"));
        let event = registration_event(Ok(WatchEvent::Modified(good)), &seen);
        assert!(matches!(event, Some(Ok(RegistrationEvent::Modified(r))) if r.name == "good"));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("8"));
    }

    #[test]
    fn expired_watch_version_is_forgotten() {
        let seen = Mutex::new(Some("8".to_string()));
        let gone: WatchEvent<DynamicObject> = serde_json::from_value(json!({
            "type": "ERROR",
            "object": {
                "status": "Failure",
                "message": "too old resource version",
                "reason": "Expired",
                "code": 410
            }
        }))
        .unwrap();

        let event = registration_event(Ok(gone), &seen);
        assert!(matches!(event, Some(Err(KubeError::Api { code: 410, .. }))));
        assert!(seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn registration_list_keeps_good_entries_next_to_malformed_ones() {
        let api = CannedApi::new().with_object(
            CLUSTERS_PATH,
            object_list(
                "kueue.x-k8s.io/v1beta1",
                "MultiKueueCluster",
                "41",
                vec![
                    cluster("good", json!("good-kubeconfig"), "40"),
                    cluster("broken", json!(42), "41"),
                ],
            ),
        );
        let hub = KubeHub::new(api.client());

        let listed = hub.list_cluster_registrations().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            listed[0].as_ref().unwrap(),
            &ClusterRegistration::secret("good", "good-kubeconfig")
        );
        assert!(
            matches!(&listed[1], Err(KubeError::InvalidObject { name, .. }) if name == "broken")
        );
    }

    #[tokio::test]
    async fn watch_resumes_from_listed_version_and_skips_malformed_objects() {
        let api = CannedApi::new()
            .with_object(
                CLUSTERS_PATH,
                object_list("kueue.x-k8s.io/v1beta1", "MultiKueueCluster", "41", vec![]),
            )
            .with_watch(
                CLUSTERS_PATH,
                vec![
                    watch_event("ADDED", cluster("broken", json!(42), "42")),
                    watch_event("ADDED", cluster("good", json!("good-kubeconfig"), "43")),
                ],
            );
        let hub = KubeHub::new(api.client());

        hub.list_cluster_registrations().await.unwrap();
        let feed = hub.watch_cluster_registrations().await.unwrap();
        let events: Vec<_> = feed.collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(RegistrationEvent::Added(r)) if r.name == "good"));

        let watch = api
            .requests()
            .into_iter()
            .find(|r| r.contains("watch=true"))
            .unwrap();
        assert!(watch.contains("resourceVersion=41"), "{watch}");

        // The next subscription picks up after the last event seen.
        hub.watch_cluster_registrations().await.unwrap().collect::<Vec<_>>().await;
        let last = api.requests().pop().unwrap();
        assert!(last.contains("resourceVersion=43"), "{last}");
    }

    #[tokio::test]
    async fn workload_list_survives_a_malformed_neighbour() {
        let api = CannedApi::new().with_object(
            "/apis/kueue.x-k8s.io/v1beta1/namespaces/team-a/workloads",
            object_list(
                "kueue.x-k8s.io/v1beta1",
                "Workload",
                "9",
                vec![
                    workload("wl-bad", "build-1", json!({ "clusterName": 42 })),
                    workload("wl-good", "build-2", json!({ "admission": {}, "clusterName": "c1" })),
                ],
            ),
        );
        let hub = KubeHub::new(api.client());

        let workloads = hub.list_workloads("team-a").await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert!(workloads[0].is_owned_by("PipelineRun", "build-2"));
        assert_eq!(workloads[0].cluster_name.as_deref(), Some("c1"));
    }
}
