//! Caller authorization.
//!
//! Every non-health request carries the caller's bearer token. The token is
//! reviewed against the hub for the exact resource the request touches;
//! the proxy's own credentials are never used for the decision.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use tracing::debug;

use mkproxy_kube::{AccessReviewer, ResourceAttributes};

use crate::error::ProxyError;

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ProxyError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::MissingCredential)?;
    let (scheme, token) = value.split_once(' ').ok_or(ProxyError::MissingCredential)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ProxyError::MissingCredential);
    }
    Ok(token)
}

/// Attributes for reading a job.
pub fn job_access(namespace: &str, job: &str) -> ResourceAttributes {
    ResourceAttributes {
        namespace: namespace.to_string(),
        verb: "get".to_string(),
        group: "tekton.dev".to_string(),
        version: "v1".to_string(),
        resource: "pipelineruns".to_string(),
        subresource: None,
        name: job.to_string(),
    }
}

/// Attributes for reading a pod.
pub fn pod_access(namespace: &str, pod: &str) -> ResourceAttributes {
    ResourceAttributes {
        namespace: namespace.to_string(),
        verb: "get".to_string(),
        version: "v1".to_string(),
        resource: "pods".to_string(),
        name: pod.to_string(),
        ..ResourceAttributes::default()
    }
}

/// Attributes for reading a pod's logs.
pub fn log_access(namespace: &str, pod: &str) -> ResourceAttributes {
    ResourceAttributes {
        subresource: Some("log".to_string()),
        ..pod_access(namespace, pod)
    }
}

pub struct Authorizer {
    reviewer: Arc<dyn AccessReviewer>,
}

impl Authorizer {
    pub fn new(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { reviewer }
    }

    /// Allow the request only if the caller may perform `attrs`.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        attrs: &ResourceAttributes,
    ) -> Result<(), ProxyError> {
        let token = bearer_token(headers)?;
        let decision = self.reviewer.review(token, attrs).await.map_err(|e| {
            if e.is_unauthorized() {
                ProxyError::Unauthenticated
            } else {
                ProxyError::Hub(e)
            }
        })?;

        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| {
                format!("not permitted to {} {}", attrs.verb, attrs.resource_path())
            });
            debug!(namespace = %attrs.namespace, name = %attrs.name, %reason, "access denied");
            return Err(ProxyError::AccessDenied(reason));
        }
        Ok(())
    }
}
