//! Prefix watcher for the lease-backed registry

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use servicerd_common::{RegistryError, Result, ServiceInstance, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{LeaseClient, WatchStream};
use crate::registry::decode_instances;

enum Wake {
    Changed,
    Cancelled,
    Closed,
}

/// Wakes on any change under the service prefix and re-reads the whole
/// prefix, so the snapshot is always a complete, current list.
pub struct EtcdWatcher {
    name: String,
    prefix: String,
    client: Arc<dyn LeaseClient>,
    stream: Option<WatchStream>,
    snapshot: Arc<Vec<ServiceInstance>>,
    /// Set while a wake is owed for the initial non-empty snapshot
    pending: bool,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl EtcdWatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        prefix: String,
        client: Arc<dyn LeaseClient>,
        stream: WatchStream,
        initial: Vec<ServiceInstance>,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            prefix,
            client,
            stream: Some(stream),
            pending: !initial.is_empty(),
            snapshot: Arc::new(initial),
            cancel,
            shutdown,
            request_timeout,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    async fn refresh(&mut self) -> Result<()> {
        let kvs = tokio::time::timeout(self.request_timeout, self.client.get_prefix(&self.prefix))
            .await
            .map_err(|_| RegistryError::unavailable("watch refresh deadline exceeded"))??;
        self.snapshot = Arc::new(decode_instances(&self.name, kvs));
        Ok(())
    }
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(RegistryError::Closed);
        };
        if self.pending {
            self.pending = false;
            return Ok(());
        }

        let wake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = self.shutdown.cancelled() => Wake::Closed,
            event = stream.message() => match event {
                Some(event) => {
                    debug!("Watch event on {}: {:?} {}", self.name, event.kind, event.key);
                    // Collapse everything already queued into this one wake
                    while stream.try_message().is_some() {}
                    Wake::Changed
                }
                None => Wake::Closed,
            },
        };

        match wake {
            Wake::Changed => self.refresh().await,
            Wake::Cancelled => Err(RegistryError::Cancelled),
            Wake::Closed => {
                self.close();
                Err(RegistryError::Closed)
            }
        }
    }

    fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.snapshot.clone()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed watcher on {}", self.name);
        }
    }
}
