//! Broadcast-backed `Registry` and `Discovery`

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use servicerd_common::{
    Backoff, Discovery, EventSink, Registry, RegistryError, RegistryEvent, Result,
    ServiceInstance, TracingEventSink, Watcher,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CatalogClient, ServiceEntries};
use crate::heartbeat::{Heartbeat, RegistrationGate};
use crate::model::registration_for;
use crate::options::ConsulOptions;
use crate::service_set::ServiceSet;
use crate::watcher::{ConsulWatcher, ServiceSets};

/// A registration owned by this registry. `task` is `None` while the agent
/// registration is still in flight.
struct Registration {
    service_id: String,
    gate: RegistrationGate,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    fn is_live(&self) -> bool {
        self.task.as_ref().is_none_or(|task| !task.is_finished())
    }
}

/// Claim on a key held by an in-flight `register`; gives the key up when
/// dropped without `commit`.
struct Reservation<'a> {
    registry: &'a ConsulRegistry,
    key: String,
    gate: RegistrationGate,
    cancel: CancellationToken,
    committed: bool,
}

impl Reservation<'_> {
    fn owns(&self, registration: &Registration) -> bool {
        Arc::ptr_eq(&registration.gate, &self.gate)
    }

    /// Hand the key over to the heartbeat. Fails with `Cancelled` when the
    /// key was deregistered in the meantime.
    fn commit(mut self, heartbeat: Heartbeat) -> Result<()> {
        let Some(mut registration) = self.registry.registrations.get_mut(&self.key) else {
            return Err(RegistryError::Cancelled);
        };
        if !self.owns(&registration) || self.cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        registration.task = Some(tokio::spawn(heartbeat.run()));
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
    }
}

/// Registry over a Consul agent.
///
/// Watchers of the same name share one `ServiceSet` fed by a single
/// blocking-query loop, which starts with the first watcher and stops when
/// the last one closes.
pub struct ConsulRegistry {
    client: Arc<dyn CatalogClient>,
    options: ConsulOptions,
    backoff: Arc<Backoff>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    sets: ServiceSets,
    registrations: DashMap<String, Registration>,
}

impl ConsulRegistry {
    pub fn new(client: Arc<dyn CatalogClient>, options: ConsulOptions) -> Self {
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
            sets: Arc::new(DashMap::new()),
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

    pub fn options(&self) -> &ConsulOptions {
        &self.options
    }

    pub fn key_of(&self, instance: &ServiceInstance) -> String {
        format!("{}/{}", instance.name, instance.id)
    }

    pub fn is_heartbeat_running(&self, instance: &ServiceInstance) -> bool {
        self.registrations
            .get(&self.key_of(instance))
            .is_some_and(|r| r.task.as_ref().is_some_and(|task| !task.is_finished()))
    }

    /// Whether a resolver loop is currently feeding watchers of `name`.
    pub fn is_watching(&self, name: &str) -> bool {
        self.live_set(name).is_some()
    }

    /// Open watchers of `name`.
    pub fn watcher_count(&self, name: &str) -> usize {
        self.live_set(name).map_or(0, |set| set.watcher_count())
    }

    /// Stop heartbeats and resolvers, then deregister every instance this
    /// registry registered. Open watchers report `Closed` afterwards.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.close_sets();

        let keys: Vec<String> = self.registrations.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((_, registration)) = self.registrations.remove(&key) else {
                continue;
            };
            if let Some(task) = registration.task {
                let wait = self.options.attempt_timeout * 2;
                if tokio::time::timeout(wait, task).await.is_err() {
                    warn!("Heartbeat for {} did not stop within {:?}", key, wait);
                }
            }
            let _gate = registration.gate.lock().await;
            if let Err(e) = self
                .with_deadline(self.client.deregister_service(&registration.service_id))
                .await
            {
                warn!("Failed to deregister {} on close: {}", key, e);
            }
        }
        info!("Consul registry closed");
    }

    /// Claim `key` for an in-flight registration. A claim whose heartbeat
    /// already gave up is replaced.
    fn reserve(&self, key: &str, service_id: &str) -> Result<Reservation<'_>> {
        let gate: RegistrationGate = Arc::new(Mutex::new(()));
        let cancel = self.shutdown.child_token();
        let claim = Registration {
            service_id: service_id.to_string(),
            gate: gate.clone(),
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
            gate,
            cancel,
            committed: false,
        })
    }

    fn close_sets(&self) {
        for entry in self.sets.iter() {
            entry.value().close();
        }
        self.sets.clear();
    }

    fn live_set(&self, name: &str) -> Option<Arc<ServiceSet>> {
        self.sets
            .get(name)
            .map(|set| set.value().clone())
            .filter(|set| !set.is_closed())
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

    async fn fetch(&self, name: &str, passing_only: bool) -> Result<ServiceEntries> {
        self.with_deadline(self.client.service(name, 0, Duration::ZERO, passing_only))
            .await
    }

    fn new_set(&self, name: &str, seed: Option<ServiceEntries>) -> Arc<ServiceSet> {
        let initial = seed.map(|s| s.instances).unwrap_or_default();
        Arc::new(ServiceSet::new(name, initial, self.shutdown.child_token()))
    }

    fn spawn_resolver(&self, set: Arc<ServiceSet>, index: u64) {
        let resolver = Resolver {
            client: self.client.clone(),
            set,
            wait: self.options.blocking_wait,
            passing_only: self.options.passing_only,
            retry_delay: self.options.error_retry_delay,
        };
        tokio::spawn(resolver.run(index));
    }
}

/// Blocking-query loop feeding one `ServiceSet`.
struct Resolver {
    client: Arc<dyn CatalogClient>,
    set: Arc<ServiceSet>,
    wait: Duration,
    passing_only: bool,
    retry_delay: Duration,
}

impl Resolver {
    async fn run(self, mut index: u64) {
        let name = self.set.service_name().to_string();
        let cancel = self.set.cancelled_token().clone();
        debug!("Resolver for {} started at index {}", name, index);

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.client.service(&name, index, self.wait, self.passing_only) => result,
            };

            match result {
                Ok(entries) => {
                    if entries.index < index {
                        debug!(
                            "Index of {} went backwards ({} -> {}), resetting",
                            name, index, entries.index
                        );
                        index = 0;
                    } else {
                        index = entries.index;
                    }
                    if !same_instances(&self.set.snapshot(), &entries.instances) {
                        self.set.broadcast(entries.instances);
                    }
                }
                Err(e) => {
                    warn!("Failed to resolve service {}: {}", name, e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }

        // Reached on registry shutdown too; dropping the slots closes watchers
        self.set.close();
        debug!("Resolver for {} stopped", name);
    }
}

fn same_instances(current: &[ServiceInstance], next: &[ServiceInstance]) -> bool {
    if current.len() != next.len() {
        return false;
    }
    let current: HashSet<&ServiceInstance> = current.iter().collect();
    next.iter().all(|instance| current.contains(instance))
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        instance.validate()?;
        let key = self.key_of(instance);
        let registration = registration_for(
            instance,
            self.options.ttl,
            self.options.deregister_critical_after,
        )?;

        let reservation = self.reserve(&key, &instance.id)?;
        if self.is_registered(instance).await? {
            return Err(RegistryError::AlreadyRegistered { key });
        }

        {
            // Deregister waits for this gate, so it always runs after the write
            let _gate = reservation.gate.lock().await;
            if reservation.cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            if let Err(e) = self
                .with_deadline(self.client.register_service(&registration))
                .await
            {
                self.events.on_event(&RegistryEvent::RegistrationFailed {
                    key: key.clone(),
                    service: instance.name.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }

        let heartbeat = Heartbeat {
            client: self.client.clone(),
            key: key.clone(),
            registration,
            interval: self.options.heartbeat_interval(),
            max_retry: self.options.max_retry,
            attempt_timeout: self.options.attempt_timeout,
            backoff: self.backoff.clone(),
            events: self.events.clone(),
            gate: reservation.gate.clone(),
            cancel: reservation.cancel.clone(),
        };
        reservation.commit(heartbeat)?;

        self.events.on_event(&RegistryEvent::Initialized {
            key,
            service: instance.name.clone(),
        });
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let key = self.key_of(instance);

        let gate = self.registrations.remove(&key).map(|(_, registration)| {
            registration.cancel.cancel();
            registration.gate
        });
        // Wait out a re-registration attempt already in flight
        let _gate = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        self.with_deadline(self.client.deregister_service(&instance.id))
            .await?;

        self.events.on_event(&RegistryEvent::Deregistered {
            key,
            service: instance.name.clone(),
        });
        Ok(())
    }

    async fn is_registered(&self, instance: &ServiceInstance) -> Result<bool> {
        let entries = self.fetch(&instance.name, false).await?;
        Ok(entries.instances.iter().any(|i| i.id == instance.id))
    }
}

#[async_trait]
impl Discovery for ConsulRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        if let Some(set) = self.live_set(name) {
            return Ok(set.snapshot().as_ref().clone());
        }
        Ok(self.fetch(name, self.options.passing_only).await?.instances)
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<Box<dyn Watcher>> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        // Seed a new set before taking the map lock; never awaited under it.
        let mut seed = match self.live_set(name) {
            Some(_) => None,
            None => Some(self.fetch(name, self.options.passing_only).await?),
        };
        let index = seed.as_ref().map_or(0, |s| s.index);

        let (set, id, signal, created) = match self.sets.entry(name.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_closed() => {
                let set = self.new_set(name, seed.take());
                occupied.insert(set.clone());
                let (id, signal) = set.add_watcher();
                (set, id, signal, true)
            }
            Entry::Occupied(occupied) => {
                let set = occupied.get().clone();
                let (id, signal) = set.add_watcher();
                (set, id, signal, false)
            }
            Entry::Vacant(vacant) => {
                let set = self.new_set(name, seed.take());
                let inserted = vacant.insert(set.clone());
                let (id, signal) = set.add_watcher();
                drop(inserted);
                (set, id, signal, true)
            }
        };

        if created {
            self.spawn_resolver(set.clone(), index);
        }
        debug!("Watching {} ({} watchers)", name, set.watcher_count());

        Ok(Box::new(ConsulWatcher::new(
            id,
            set,
            self.sets.clone(),
            signal,
            cancel,
        )))
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.close_sets();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "orders", vec![])
    }

    #[test]
    fn test_same_instances_ignores_order() {
        let a = vec![instance("a1"), instance("a2")];
        let b = vec![instance("a2"), instance("a1")];
        assert!(same_instances(&a, &b));
        assert!(!same_instances(&a, &[instance("a1")]));
        assert!(!same_instances(&a, &[instance("a1"), instance("a3")]));
        assert!(same_instances(&[], &[]));
    }
}
