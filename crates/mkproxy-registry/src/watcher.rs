//! Registry watcher: the single background task keeping the cache current.
//!
//! Resyncs on startup, then applies registration events strictly in
//! arrival order. When the feed ends or fails the watcher backs off
//! (1s doubling to 60s), resyncs and subscribes again. The backoff resets
//! once a subscription delivers an event.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mkproxy_kube::{KubeError, RegistrationEvent, RegistrationFeed};

use crate::loader::ConfigLoader;
use crate::registry::ClusterConfigRegistry;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Resubscribe delay, doubled per consecutive failure up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
        }
    }

    /// Delay to wait now; the following delay doubles.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

/// How a subscription ended.
enum FeedEnd {
    Shutdown,
    Closed,
    Failed(KubeError),
}

pub struct RegistryWatcher {
    loader: ConfigLoader,
    registry: Arc<ClusterConfigRegistry>,
    backoff: Backoff,
}

impl RegistryWatcher {
    pub fn new(loader: ConfigLoader, registry: Arc<ClusterConfigRegistry>) -> Self {
        Self {
            loader,
            registry,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run on a background task until `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("registry watcher started");
        loop {
            let cycle = async {
                self.resync().await;
                self.loader.hub().watch_cluster_registrations().await
            };
            let subscribed = tokio::select! {
                result = cycle => result,
                _ = stopped(&mut shutdown) => break,
            };

            match subscribed {
                Ok(feed) => match self.consume(feed, &mut shutdown).await {
                    FeedEnd::Shutdown => break,
                    FeedEnd::Closed => {
                        // Routine server-side watch timeout.
                        debug!("registration feed closed");
                        self.backoff.reset();
                    }
                    FeedEnd::Failed(e) => warn!(error = %e, "registration feed failed"),
                },
                Err(e) => warn!(error = %e, "failed to subscribe to registration changes"),
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "resubscribing after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
        info!("registry watcher shutting down");
    }

    async fn consume(
        &mut self,
        mut feed: RegistrationFeed,
        shutdown: &mut watch::Receiver<bool>,
    ) -> FeedEnd {
        loop {
            let item = tokio::select! {
                item = feed.next() => item,
                _ = stopped(shutdown) => return FeedEnd::Shutdown,
            };
            match item {
                Some(Ok(event)) => {
                    self.backoff.reset();
                    self.apply(event).await;
                }
                Some(Err(e)) => return FeedEnd::Failed(e),
                None => return FeedEnd::Closed,
            }
        }
    }

    async fn apply(&self, event: RegistrationEvent) {
        match event {
            RegistrationEvent::Added(registration) | RegistrationEvent::Modified(registration) => {
                debug!(cluster = %registration.name, "registration changed, resyncing");
                self.resync().await;
            }
            RegistrationEvent::Deleted(name) => {
                self.registry.remove(&name).await;
            }
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.loader.resync(&self.registry).await {
            warn!(error = %e, "worker cluster resync failed");
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
