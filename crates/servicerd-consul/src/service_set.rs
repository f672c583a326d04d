//! Shared per-name instance set with watcher fan-out

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use servicerd_common::ServiceInstance;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Instances of one service name plus the signal slots of its watchers.
///
/// The snapshot is replaced wholesale on every broadcast, so readers never
/// see a partially updated list. Each watcher owns a capacity-one channel:
/// a signal sent while one is already pending is dropped, which is how
/// bursts coalesce into a single wake.
pub struct ServiceSet {
    service_name: String,
    services: ArcSwap<Vec<ServiceInstance>>,
    watchers: RwLock<HashMap<u64, mpsc::Sender<()>>>,
    next_watcher: AtomicU64,
    /// Stops the resolver loop feeding this set
    cancel: CancellationToken,
}

impl ServiceSet {
    pub fn new(
        service_name: impl Into<String>,
        initial: Vec<ServiceInstance>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            services: ArcSwap::from_pointee(initial),
            watchers: RwLock::new(HashMap::new()),
            next_watcher: AtomicU64::new(1),
            cancel,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn snapshot(&self) -> Arc<Vec<ServiceInstance>> {
        self.services.load_full()
    }

    /// Publish `services` and signal every watcher. Never blocks on a slow watcher.
    pub fn broadcast(&self, services: Vec<ServiceInstance>) {
        self.services.store(Arc::new(services));

        let watchers = self.watchers.read();
        trace!(
            "Broadcasting {} to {} watchers",
            self.service_name,
            watchers.len()
        );
        for tx in watchers.values() {
            let _ = tx.try_send(());
        }
    }

    /// Register a watcher slot. It starts with a pending signal when the
    /// set already holds instances.
    pub(crate) fn add_watcher(&self) -> (u64, mpsc::Receiver<()>) {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.watchers.write().insert(id, tx.clone());

        // Checked after insertion so a concurrent broadcast cannot slip between
        if !self.services.load().is_empty() {
            let _ = tx.try_send(());
        }
        (id, rx)
    }

    /// Drop the slot of watcher `id`. Returns whether no watchers remain.
    pub(crate) fn remove_watcher(&self, id: u64) -> bool {
        let mut watchers = self.watchers.write();
        watchers.remove(&id);
        watchers.is_empty()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.read().len()
    }

    /// Stop the resolver and drop every slot; open watchers then report `Closed`.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        self.watchers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancelled_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "orders", vec![])
    }

    #[test]
    fn test_broadcast_coalesces_signals() {
        let set = ServiceSet::new("orders", vec![], CancellationToken::new());
        let (_, mut rx) = set.add_watcher();
        assert!(rx.try_recv().is_err());

        set.broadcast(vec![instance("a1")]);
        set.broadcast(vec![instance("a1"), instance("a2")]);
        set.broadcast(vec![instance("a3")]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(*set.snapshot(), vec![instance("a3")]);
    }

    #[test]
    fn test_new_watcher_gets_initial_signal_when_non_empty() {
        let set = ServiceSet::new("orders", vec![instance("a1")], CancellationToken::new());
        let (_, mut rx) = set.add_watcher();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove_watcher_reports_empty() {
        let set = ServiceSet::new("orders", vec![], CancellationToken::new());
        let (first, _rx1) = set.add_watcher();
        let (second, _rx2) = set.add_watcher();
        assert_eq!(set.watcher_count(), 2);
        assert!(!set.remove_watcher(first));
        assert!(set.remove_watcher(second));
    }

    #[test]
    fn test_close_drops_slots() {
        let set = ServiceSet::new("orders", vec![], CancellationToken::new());
        let (_, mut rx) = set.add_watcher();
        set.close();
        assert!(set.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
