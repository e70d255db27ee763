//! Router configuration.

use std::time::Duration;

/// Label carried by TaskRuns and Pods of a PipelineRun.
pub const DEFAULT_JOB_LABEL: &str = "tekton.dev/pipelineRun";

/// Response header naming the worker cluster that served a request.
pub const WORKER_CLUSTER_HEADER: &str = "x-worker-cluster";

/// Values the router consumes as given.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bound on every unary request, including a bounded log fetch.
    pub request_timeout: Duration,
    /// `tailLines` used when the caller gives none.
    pub default_log_tail_lines: i64,
    /// Absolute write deadline for a streaming relay.
    pub stream_write_deadline: Duration,
    /// Chunks buffered between the upstream and outbound pumps.
    pub stream_buffer_chunks: usize,
    pub job_label: String,
}

impl ProxyConfig {
    /// Label selector for the sub-resources of `job`.
    pub fn job_selector(&self, job: &str) -> String {
        format!("{}={job}", self.job_label)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            default_log_tail_lines: 100,
            stream_write_deadline: Duration::from_secs(24 * 60 * 60),
            stream_buffer_chunks: 64,
            job_label: DEFAULT_JOB_LABEL.to_string(),
        }
    }
}
