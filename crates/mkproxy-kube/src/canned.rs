//! A canned Kubernetes API server for driving the kube-rs clients in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};

/// Serves fixed JSON by request path. Watch requests get their events as
/// one newline-delimited body, after which the stream ends.
#[derive(Clone, Default)]
pub struct CannedApi {
    objects: BTreeMap<String, Value>,
    watches: BTreeMap<String, Vec<Value>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer GETs on `path` with `body`.
    pub fn with_object(mut self, path: &str, body: Value) -> Self {
        self.objects.insert(path.to_string(), body);
        self
    }

    /// Answer watches on `path` with `events`.
    pub fn with_watch(mut self, path: &str, events: Vec<Value>) -> Self {
        self.watches.insert(path.to_string(), events);
        self
    }

    /// A client for this server. Must be called inside a tokio runtime.
    pub fn client(&self) -> Client {
        let objects = Arc::new(self.objects.clone());
        let watches = Arc::new(self.watches.clone());
        let requests = self.requests.clone();
        let service = tower::service_fn(move |req: Request<Body>| {
            let response = respond(&objects, &watches, &requests, &req);
            async move { response }
        });
        Client::new(service, "default")
    }

    /// Path and query of every request served so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn respond(
    objects: &BTreeMap<String, Value>,
    watches: &BTreeMap<String, Vec<Value>>,
    requests: &Mutex<Vec<String>>,
    req: &Request<Body>,
) -> Result<Response<Body>, http::Error> {
    requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(req.uri().to_string());

    let path = req.uri().path();
    let watching = req
        .uri()
        .query()
        .is_some_and(|q| q.split('&').any(|p| p == "watch=true"));

    let found = if watching {
        watches
            .get(path)
            .map(|events| events.iter().map(|e| format!("{e}\n")).collect::<String>())
    } else {
        objects.get(path).map(Value::to_string)
    };
    let (status, body) = match found {
        Some(body) => (StatusCode::OK, body),
        None => (StatusCode::NOT_FOUND, not_found(path).to_string()),
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.into_bytes()))
}

fn not_found(path: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{path} not found"),
        "reason": "NotFound",
        "code": 404
    })
}

/// A list response as the API server returns it.
pub fn object_list(
    api_version: &str,
    kind: &str,
    resource_version: &str,
    items: Vec<Value>,
) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": format!("{kind}List"),
        "metadata": { "resourceVersion": resource_version },
        "items": items
    })
}

/// One line of a watch body.
pub fn watch_event(event_type: &str, object: Value) -> Value {
    json!({ "type": event_type, "object": object })
}

/// A Secret holding `value` under `key`.
pub fn secret_object(namespace: &str, name: &str, key: &str, value: &[u8]) -> Value {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))])),
        ..Secret::default()
    };
    serde_json::to_value(secret).unwrap_or(Value::Null)
}
