//! Watcher over a shared `ServiceSet`

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use servicerd_common::{RegistryError, Result, ServiceInstance, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service_set::ServiceSet;

pub(crate) type ServiceSets = Arc<DashMap<String, Arc<ServiceSet>>>;

enum Wake {
    Changed,
    Cancelled,
    Closed,
}

pub struct ConsulWatcher {
    id: u64,
    set: Arc<ServiceSet>,
    sets: ServiceSets,
    signal: Option<mpsc::Receiver<()>>,
    cancel: CancellationToken,
}

impl ConsulWatcher {
    pub(crate) fn new(
        id: u64,
        set: Arc<ServiceSet>,
        sets: ServiceSets,
        signal: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            set,
            sets,
            signal: Some(signal),
            cancel,
        }
    }

    pub fn service_name(&self) -> &str {
        self.set.service_name()
    }
}

#[async_trait]
impl Watcher for ConsulWatcher {
    async fn next(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let Some(signal) = self.signal.as_mut() else {
            return Err(RegistryError::Closed);
        };

        let wake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            received = signal.recv() => match received {
                Some(()) => Wake::Changed,
                None => Wake::Closed,
            },
        };

        match wake {
            Wake::Changed => Ok(()),
            Wake::Cancelled => Err(RegistryError::Cancelled),
            Wake::Closed => {
                self.close();
                Err(RegistryError::Closed)
            }
        }
    }

    fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.set.snapshot()
    }

    fn close(&mut self) {
        if self.signal.take().is_none() {
            return;
        }

        // Emptiness is decided under the map's shard lock, the same lock
        // `watch` holds while adding, so a new watcher is never attached to
        // a set that is being torn down.
        let mut in_map = false;
        let removed = self.sets.remove_if(self.set.service_name(), |_, set| {
            if !Arc::ptr_eq(set, &self.set) {
                return false;
            }
            in_map = true;
            set.remove_watcher(self.id)
        });
        if !in_map {
            self.set.remove_watcher(self.id);
        }
        if removed.is_some() {
            self.set.close();
            debug!("Last watcher of {} closed, stopped resolver", self.set.service_name());
        } else {
            debug!("Closed watcher {} on {}", self.id, self.set.service_name());
        }
    }
}

impl Drop for ConsulWatcher {
    fn drop(&mut self) {
        self.close();
    }
}
