//! Daemon settings: flags and `MKPROXY_*` variables over an optional TOML
//! file over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use mkproxy_api::ProxyConfig;
use mkproxy_registry::DEFAULT_SECRET_KEY;
use mkproxy_resolver::DEFAULT_OWNER_KIND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mkproxyd", about = "Multicluster proxy for MultiKueue-dispatched PipelineRuns")]
pub struct Cli {
    /// TOML settings file.
    #[arg(long, env = "MKPROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, env = "MKPROXY_PORT")]
    pub port: Option<u16>,

    /// Namespace holding worker kubeconfig secrets.
    #[arg(long, env = "MKPROXY_WORKERS_SECRET_NAMESPACE")]
    pub workers_secret_namespace: Option<String>,

    /// Bound on unary requests (e.g. 30s, 500ms, 5m).
    #[arg(long, env = "MKPROXY_REQUEST_TIMEOUT", value_parser = parse_duration_arg)]
    pub request_timeout: Option<Duration>,

    /// tailLines used when a log request gives none.
    #[arg(
        long,
        env = "MKPROXY_DEFAULT_LOG_TAIL_LINES",
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    pub default_log_tail_lines: Option<i64>,

    /// Write deadline for streaming log connections.
    #[arg(long, env = "MKPROXY_STREAM_WRITE_DEADLINE", value_parser = parse_duration_arg)]
    pub stream_write_deadline: Option<Duration>,

    /// Log chunks buffered per streaming connection.
    #[arg(long, env = "MKPROXY_STREAM_BUFFER_CHUNKS")]
    pub stream_buffer_chunks: Option<usize>,

    /// Hub kubeconfig. Defaults to in-cluster config, then ~/.kube/config.
    #[arg(long, env = "MKPROXY_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, env = "MKPROXY_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

/// Settings as read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileSettings {
    pub port: Option<u16>,
    pub workers_secret_namespace: Option<String>,
    pub secret_key: Option<String>,
    pub request_timeout: Option<String>,
    pub default_log_tail_lines: Option<i64>,
    pub stream_write_deadline: Option<String>,
    pub stream_buffer_chunks: Option<usize>,
    pub kubeconfig: Option<PathBuf>,
    pub job_label: Option<String>,
    pub owner_kind: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl FileSettings {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing settings file {}", path.display()))
    }
}

/// Resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub secret_namespace: String,
    pub secret_key: String,
    pub request_timeout: Duration,
    pub default_log_tail_lines: i64,
    pub stream_write_deadline: Duration,
    pub stream_buffer_chunks: usize,
    pub kubeconfig: Option<PathBuf>,
    pub job_label: String,
    pub owner_kind: String,
    pub log_format: LogFormat,
}

impl Settings {
    /// Read the file named by `--config`, if any, and layer the flags over it.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => FileSettings::read(path)?,
            None => FileSettings::default(),
        };
        Self::resolve(cli, file)
    }

    pub fn resolve(cli: &Cli, file: FileSettings) -> anyhow::Result<Self> {
        let defaults = ProxyConfig::default();

        let request_timeout = layered_duration(
            "request-timeout",
            cli.request_timeout,
            file.request_timeout.as_deref(),
            defaults.request_timeout,
        )?;
        let stream_write_deadline = layered_duration(
            "stream-write-deadline",
            cli.stream_write_deadline,
            file.stream_write_deadline.as_deref(),
            defaults.stream_write_deadline,
        )?;

        let settings = Self {
            port: cli.port.or(file.port).unwrap_or(8080),
            secret_namespace: cli
                .workers_secret_namespace
                .clone()
                .or(file.workers_secret_namespace)
                .unwrap_or_else(|| "kueue-system".to_string()),
            secret_key: file.secret_key.unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string()),
            request_timeout,
            default_log_tail_lines: cli
                .default_log_tail_lines
                .or(file.default_log_tail_lines)
                .unwrap_or(defaults.default_log_tail_lines),
            stream_write_deadline,
            stream_buffer_chunks: cli
                .stream_buffer_chunks
                .or(file.stream_buffer_chunks)
                .unwrap_or(defaults.stream_buffer_chunks),
            kubeconfig: cli.kubeconfig.clone().or(file.kubeconfig),
            job_label: file.job_label.unwrap_or(defaults.job_label),
            owner_kind: file.owner_kind.unwrap_or_else(|| DEFAULT_OWNER_KIND.to_string()),
            log_format: cli.log_format.or(file.log_format).unwrap_or_default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request-timeout must be greater than zero");
        }
        if self.stream_write_deadline.is_zero() {
            bail!("stream-write-deadline must be greater than zero");
        }
        if self.stream_buffer_chunks == 0 {
            bail!("stream-buffer-chunks must be at least 1");
        }
        if self.default_log_tail_lines < 0 {
            bail!("default-log-tail-lines must not be negative");
        }
        if self.secret_namespace.is_empty() {
            bail!("workers-secret-namespace must not be empty");
        }
        Ok(())
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            request_timeout: self.request_timeout,
            default_log_tail_lines: self.default_log_tail_lines,
            stream_write_deadline: self.stream_write_deadline,
            stream_buffer_chunks: self.stream_buffer_chunks,
            job_label: self.job_label.clone(),
        }
    }
}

fn layered_duration(
    name: &str,
    flag: Option<Duration>,
    file: Option<&str>,
    default: Duration,
) -> anyhow::Result<Duration> {
    match (flag, file) {
        (Some(d), _) => Ok(d),
        (None, Some(s)) => parse_duration(s).with_context(|| format!("invalid {name} {s:?}")),
        (None, None) => Ok(default),
    }
}

/// Parse `500ms`, `30s`, `5m`, `24h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parse = |n: &str| n.parse::<u64>().with_context(|| format!("not a duration: {s:?}"));
    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(ms)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(secs)?))
    } else if let Some(mins) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(mins)? * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(hours)? * 60 * 60))
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}
