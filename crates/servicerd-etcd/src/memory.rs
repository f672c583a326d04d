//! In-process lease store
//!
//! Implements `LeaseClient` with the same lease semantics as etcd: keys
//! attached to a lease disappear when it expires or is revoked, and watchers
//! see the resulting deletes. Used for embedded single-process deployments
//! and to drive the registry through outages in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use servicerd_common::{RegistryError, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{
    KeepAliveResponse, KeepAliveStream, KeyValue, LeaseClient, LeaseId, WatchEvent,
    WatchEventKind, WatchStream,
};

const WATCH_CHANNEL_CAPACITY: usize = 64;

struct LeaseEntry {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
}

struct WatchEntry {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

struct Inner {
    state: Mutex<State>,
    watchers: Mutex<Vec<WatchEntry>>,
    available: AtomicBool,
    /// Fired to drop every open keep-alive stream, as a lost connection would
    connection: Mutex<CancellationToken>,
    next_lease: AtomicI64,
}

/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryLeaseStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                watchers: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                connection: Mutex::new(CancellationToken::new()),
                next_lease: AtomicI64::new(1),
            }),
        }
    }

    /// Simulate the store becoming unreachable (`false`) or reachable again.
    ///
    /// While unavailable every client call fails and keep-alive streams end.
    /// Leases keep expiring on schedule, as they would server-side.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.interrupt_keepalives();
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Close every open keep-alive stream without touching the leases.
    pub fn interrupt_keepalives(&self) {
        let old = std::mem::replace(&mut *self.inner.connection.lock(), CancellationToken::new());
        old.cancel();
    }

    /// Expire `lease` immediately, as a server-side eviction would.
    pub fn evict_lease(&self, lease: LeaseId) {
        self.inner.expire(lease);
    }

    /// Lease currently attached to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.inner
            .state
            .lock()
            .kvs
            .get(key)
            .map(|kv| kv.lease)
            .filter(|id| *id != 0)
    }

    /// Number of leases that are granted and not yet expired or revoked.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RegistryError::unavailable("memory store is offline"))
        }
    }
}

impl Inner {
    fn notify(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        for event in events {
            for watcher in watchers.iter().filter(|w| event.key.starts_with(&w.prefix)) {
                // A full channel already holds a pending wake
                let _ = watcher.tx.try_send(event.clone());
            }
        }
    }

    /// Remove `lease` and its keys.
    fn expire(&self, lease: LeaseId) -> bool {
        let events = {
            let mut state = self.state.lock();
            if state.leases.remove(&lease).is_none() {
                return false;
            }
            let keys: Vec<String> = state
                .kvs
                .values()
                .filter(|kv| kv.lease == lease)
                .map(|kv| kv.key.clone())
                .collect();
            for key in &keys {
                state.kvs.remove(key);
            }
            keys.into_iter()
                .map(|key| WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                })
                .collect::<Vec<_>>()
        };
        self.notify(events);
        true
    }

    fn refresh(&self, lease: LeaseId) -> Option<Duration> {
        let mut state = self.state.lock();
        let entry = state.leases.get_mut(&lease)?;
        entry.expires_at = Instant::now() + entry.ttl;
        Some(entry.ttl)
    }
}

/// Expire `lease` once its deadline passes without renewal.
async fn reap(inner: Weak<Inner>, lease: LeaseId) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else { return };
            let state = inner.state.lock();
            match state.leases.get(&lease) {
                Some(entry) => entry.expires_at,
                None => return,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let Some(inner) = inner.upgrade() else { return };
        let expired = {
            let state = inner.state.lock();
            state
                .leases
                .get(&lease)
                .is_some_and(|entry| entry.expires_at <= Instant::now())
        };
        if expired {
            debug!("Lease {} expired", lease);
            inner.expire(lease);
            return;
        }
    }
}

#[async_trait]
impl LeaseClient for MemoryLeaseStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_available()?;
        let id = self.inner.next_lease.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().leases.insert(
            id,
            LeaseEntry {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        tokio::spawn(reap(Arc::downgrade(&self.inner), id));
        Ok(id)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        self.inner.expire(lease);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.check_available()?;
        let ttl = self
            .inner
            .refresh(lease)
            .ok_or_else(|| RegistryError::unavailable(format!("lease {} not found", lease)))?;

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stream = KeepAliveStream::new(rx, cancel.clone());
        let connection = self.inner.connection.lock().clone();
        let store = self.clone();
        let period = (ttl / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            loop {
                if !store.is_available() {
                    return;
                }
                let Some(ttl) = store.inner.refresh(lease) else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = connection.cancelled() => return,
                    sent = tx.send(KeepAliveResponse { id: lease, ttl }) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = connection.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });

        Ok(stream)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.check_available()?;
        {
            let mut state = self.inner.state.lock();
            if let Some(id) = lease
                && !state.leases.contains_key(&id)
            {
                return Err(RegistryError::unavailable(format!("lease {} not found", id)));
            }
            state.kvs.insert(
                key.to_string(),
                KeyValue {
                    key: key.to_string(),
                    value: value.as_bytes().to_vec(),
                    lease: lease.unwrap_or(0),
                },
            );
        }
        self.inner.notify(vec![WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
        }]);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_available()?;
        Ok(self.inner.state.lock().kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        let state = self.inner.state.lock();
        Ok(state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let removed = self.inner.state.lock().kvs.remove(key).is_some();
        if removed {
            self.inner.notify(vec![WatchEvent {
                kind: WatchEventKind::Delete,
                key: key.to_string(),
            }]);
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.inner.watchers.lock().push(WatchEntry {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx, CancellationToken::new()))
    }
}
