//! Access review on behalf of the caller.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes as KubeResourceAttributes, SelfSubjectAccessReview,
    SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::config::AuthInfo;
use kube::{Client, Config};
use tracing::debug;

use crate::error::KubeResult;
use crate::types::{AccessDecision, ResourceAttributes};

/// Decides whether the holder of `token` may act on a resource.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(&self, token: &str, attrs: &ResourceAttributes) -> KubeResult<AccessDecision>;
}

/// Submits a SelfSubjectAccessReview to the hub using the caller's token.
///
/// The hub `Config` supplies the server URL and CA only; its credentials
/// are replaced by the bearer token for every review.
#[derive(Clone)]
pub struct KubeAccessReviewer {
    hub: Config,
}

impl KubeAccessReviewer {
    pub fn new(hub: Config) -> Self {
        Self { hub }
    }

    fn caller_config(&self, token: &str) -> Config {
        let mut config = self.hub.clone();
        config.auth_info = AuthInfo {
            token: Some(token.to_owned().into()),
            ..AuthInfo::default()
        };
        config
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review(&self, token: &str, attrs: &ResourceAttributes) -> KubeResult<AccessDecision> {
        let client = Client::try_from(self.caller_config(token))?;
        let api: Api<SelfSubjectAccessReview> = Api::all(client);

        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(to_kube_attributes(attrs)),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = api.create(&PostParams::default(), &review).await?;
        let status = result.status.unwrap_or_default();
        debug!(
            namespace = %attrs.namespace,
            resource = %attrs.resource_path(),
            name = %attrs.name,
            allowed = status.allowed,
            "access review completed"
        );

        Ok(AccessDecision {
            allowed: status.allowed,
            reason: status.reason.filter(|r| !r.is_empty()),
        })
    }
}

fn to_kube_attributes(attrs: &ResourceAttributes) -> KubeResourceAttributes {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    KubeResourceAttributes {
        namespace: non_empty(&attrs.namespace),
        verb: non_empty(&attrs.verb),
        group: Some(attrs.group.clone()),
        version: non_empty(&attrs.version),
        resource: non_empty(&attrs.resource),
        subresource: attrs.subresource.clone(),
        name: non_empty(&attrs.name),
        ..Default::default()
    }
}
