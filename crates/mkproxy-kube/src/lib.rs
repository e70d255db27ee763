//! mkproxy-kube: the cluster API seam for mkproxy.
//!
//! Everything the proxy needs from Kubernetes goes through four traits:
//!
//! - **`HubApi`**: Workloads, MultiKueueClusters and Secrets on the hub
//! - **`AccessReviewer`**: SelfSubjectAccessReview with the caller's token
//! - **`WorkerConnector`** / **`WorkerApi`**: TaskRuns, Pods and logs on a
//!   worker cluster, reached through a parsed `ConnectionConfig`
//!
//! The `Kube*` types implement them with kube-rs. The `memory` module
//! holds in-memory implementations used by the tests of every crate, and
//! `canned` serves fixed API responses to the kube-rs clients.

pub mod canned;
pub mod error;
pub mod hub;
pub mod memory;
pub mod review;
pub mod types;
pub mod worker;

pub use error::{KubeError, KubeResult};
pub use hub::{HubApi, KubeHub, RegistrationFeed};
pub use review::{AccessReviewer, KubeAccessReviewer};
pub use types::*;
pub use worker::{
    ConnectionConfig, KubeConnector, KubeWorker, LogStream, WorkerApi, WorkerConnector,
};
