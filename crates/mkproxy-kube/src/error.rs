//! Error types for cluster API calls.

/// Result alias for cluster API operations.
pub type KubeResult<T> = Result<T, KubeError>;

/// Errors returned by hub and worker cluster calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KubeError {
    /// The API server answered with an error status.
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    /// The request never produced an API answer (connect, TLS, decode).
    #[error("request failed: {0}")]
    Request(String),

    /// An object did not have the shape we expect.
    #[error("invalid object {name}: {reason}")]
    InvalidObject { name: String, reason: String },

    /// A kubeconfig payload could not be parsed into a client config.
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),

    /// A streaming body (logs, watch) failed mid-stream.
    #[error("stream error: {0}")]
    Stream(String),
}

impl KubeError {
    /// HTTP status returned by the API server, if any.
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The API server rejected the credential itself.
    pub fn is_unauthorized(&self) -> bool {
        self.api_code() == Some(401)
    }
}

impl From<kube::Error> for KubeError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Self::Api {
                code: resp.code,
                message: resp.message,
            },
            other => Self::Request(other.to_string()),
        }
    }
}
