//! Lease-backed `Registry` and `Discovery`

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use servicerd_common::codec::{self, instance_key, service_prefix};
use servicerd_common::{
    Backoff, Discovery, EventSink, Registry, RegistryError, RegistryEvent, Result,
    ServiceInstance, TracingEventSink, Watcher,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{KeyValue, LeaseClient, LeaseId};
use crate::heartbeat::{self, HeldLeases, Heartbeat};
use crate::options::EtcdOptions;
use crate::watcher::EtcdWatcher;

/// A registration owned by this registry. `task` is `None` while the
/// initial write is still in flight.
struct Registration {
    leases: HeldLeases,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    /// Whether this entry still claims its key.
    fn is_live(&self) -> bool {
        self.task.as_ref().is_none_or(|task| !task.is_finished())
    }
}

/// Claim on a key held by an in-flight `register`. Dropped without
/// `commit`, it gives the key up and releases any lease already granted.
struct Reservation<'a> {
    registry: &'a EtcdRegistry,
    key: String,
    leases: HeldLeases,
    cancel: CancellationToken,
    committed: bool,
}

impl Reservation<'_> {
    fn owns(&self, registration: &Registration) -> bool {
        Arc::ptr_eq(&registration.leases, &self.leases)
    }

    /// Start the heartbeat and hand the key over to it. Fails with
    /// `Cancelled` when the key was deregistered in the meantime.
    fn commit(mut self, value: String, lease: LeaseId) -> Result<()> {
        let Some(mut registration) = self.registry.registrations.get_mut(&self.key) else {
            return Err(RegistryError::Cancelled);
        };
        if !self.owns(&registration) || self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        registration.task = Some(self.registry.spawn_heartbeat(
            &self.key,
            value,
            lease,
            self.leases.clone(),
            self.cancel.clone(),
        ));
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.cancel.cancel();
        self.registry
            .registrations
            .remove_if(&self.key, |_, registration| self.owns(registration));

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.registry.client.clone();
        let leases = self.leases.clone();
        let key = self.key.clone();
        let timeout = self.registry.options.attempt_timeout;
        runtime.spawn(async move {
            heartbeat::release(client.as_ref(), &leases, &key, timeout).await;
        });
    }
}

/// Registry storing instances under leases in an etcd-like store.
pub struct EtcdRegistry {
    client: Arc<dyn LeaseClient>,
    options: EtcdOptions,
    backoff: Arc<Backoff>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    registrations: DashMap<String, Registration>,
}

impl EtcdRegistry {
    pub fn new(client: Arc<dyn LeaseClient>, options: EtcdOptions) -> Self {
        let shutdown = options
            .shutdown
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let backoff = Arc::new(Backoff::new(options.retry_base, options.max_backoff));

        Self {
            client,
            options,
            backoff,
            events: Arc::new(TracingEventSink),
            shutdown,
            registrations: DashMap::new(),
        }
    }

    /// Replace the lifecycle event sink (defaults to `TracingEventSink`).
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the backoff used between re-registration attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn options(&self) -> &EtcdOptions {
        &self.options
    }

    /// Store key of `instance`.
    pub fn key_of(&self, instance: &ServiceInstance) -> String {
        instance_key(&self.options.namespace, &instance.name, &instance.id)
    }

    /// Whether the heartbeat for `instance` is still running.
    pub fn is_heartbeat_running(&self, instance: &ServiceInstance) -> bool {
        self.registrations
            .get(&self.key_of(instance))
            .is_some_and(|r| r.task.as_ref().is_some_and(|task| !task.is_finished()))
    }

    /// Stop every heartbeat and release their leases. Watchers created by
    /// this registry report `Closed` afterwards.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let keys: Vec<String> = self.registrations.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, registration)) = self.registrations.remove(&key) {
                self.stop(&key, registration).await;
            }
        }
        info!("Lease registry closed");
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.options.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::unavailable(format!(
                "deadline of {:?} exceeded",
                self.options.request_timeout
            ))),
        }
    }

    /// Stop `registration`'s heartbeat and release whatever leases it still holds.
    async fn stop(&self, key: &str, registration: Registration) {
        registration.cancel.cancel();
        if let Some(task) = registration.task {
            let wait = self.options.attempt_timeout * 2;
            if tokio::time::timeout(wait, task).await.is_err() {
                warn!("Heartbeat for {} did not stop within {:?}", key, wait);
            }
        }
        heartbeat::release(
            self.client.as_ref(),
            &registration.leases,
            key,
            self.options.attempt_timeout,
        )
        .await;
    }

    /// Claim `key` for an in-flight registration. A claim whose heartbeat
    /// already gave up is replaced.
    fn reserve(&self, key: &str) -> Result<Reservation<'_>> {
        let leases: HeldLeases = Arc::new(Mutex::new(Vec::new()));
        let cancel = self.shutdown.child_token();
        let claim = Registration {
            leases: leases.clone(),
            cancel: cancel.clone(),
            task: None,
        };

        match self.registrations.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                return Err(RegistryError::AlreadyRegistered {
                    key: key.to_string(),
                });
            }
            Entry::Occupied(mut entry) => {
                let stale = entry.insert(claim);
                stale.cancel.cancel();
            }
            Entry::Vacant(entry) => {
                entry.insert(claim);
            }
        }

        Ok(Reservation {
            registry: self,
            key: key.to_string(),
            leases,
            cancel,
            committed: false,
        })
    }

    fn spawn_heartbeat(
        &self,
        key: &str,
        value: String,
        lease: LeaseId,
        leases: HeldLeases,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let heartbeat = Heartbeat {
            client: self.client.clone(),
            key: key.to_string(),
            value,
            ttl: self.options.ttl,
            max_retry: self.options.max_retry,
            attempt_timeout: self.options.attempt_timeout,
            backoff: self.backoff.clone(),
            events: self.events.clone(),
            leases,
            cancel,
        };
        tokio::spawn(heartbeat.run(lease))
    }

    pub(crate) async fn read_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let prefix = service_prefix(&self.options.namespace, name);
        let kvs = self.with_deadline(self.client.get_prefix(&prefix)).await?;
        Ok(decode_instances(name, kvs))
    }
}

/// Decode every stored instance of `name`, skipping undecodable records and
/// records whose name does not match.
pub(crate) fn decode_instances(name: &str, kvs: Vec<KeyValue>) -> Vec<ServiceInstance> {
    let mut instances = Vec::with_capacity(kvs.len());
    for kv in kvs {
        match codec::unmarshal(&kv.value) {
            Ok(instance) if instance.name == name => instances.push(instance),
            Ok(instance) => debug!(
                "Skipping {}: belongs to service {}, not {}",
                kv.key, instance.name, name
            ),
            Err(e) => warn!("Skipping malformed instance record {}: {}", kv.key, e),
        }
    }
    instances
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        instance.validate()?;
        let key = self.key_of(instance);
        let value = codec::marshal(instance)?;

        let reservation = self.reserve(&key)?;
        if self.is_registered(instance).await? {
            return Err(RegistryError::AlreadyRegistered { key });
        }

        let attached = self
            .with_deadline(heartbeat::attach(
                self.client.as_ref(),
                &reservation.leases,
                &reservation.cancel,
                &key,
                &value,
                self.options.ttl,
            ))
            .await;
        let lease = match attached {
            Ok(lease) => lease,
            Err(e) => {
                self.events.on_event(&RegistryEvent::RegistrationFailed {
                    key: key.clone(),
                    service: instance.name.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        reservation.commit(value, lease)?;
        self.events.on_event(&RegistryEvent::Initialized {
            key,
            service: instance.name.clone(),
        });
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.key_of(instance);

        if let Some((_, registration)) = self.registrations.remove(&key) {
            self.stop(&key, registration).await;
        }
        self.with_deadline(self.client.delete(&key)).await?;

        self.events.on_event(&RegistryEvent::Deregistered {
            key,
            service: instance.name.clone(),
        });
        Ok(())
    }

    async fn is_registered(&self, instance: &ServiceInstance) -> Result<bool> {
        let key = self.key_of(instance);
        Ok(self.with_deadline(self.client.get(&key)).await?.is_some())
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        self.read_service(name).await
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<Box<dyn Watcher>> {
        let prefix = service_prefix(&self.options.namespace, name);
        // Open the watch before the initial read so no change falls in between.
        let stream = self.with_deadline(self.client.watch_prefix(&prefix)).await?;
        let initial = self.read_service(name).await?;

        Ok(Box::new(EtcdWatcher::new(
            name,
            prefix,
            self.client.clone(),
            stream,
            initial,
            cancel,
            self.shutdown.child_token(),
            self.options.request_timeout,
        )))
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
