//! In-process catalog
//!
//! Implements `CatalogClient` with the parts of Consul's behavior the
//! registry relies on: a monotonically increasing index, blocking queries
//! that wait for it to move, and TTL checks that turn critical when not
//! refreshed and drop the service once critical for long enough.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use servicerd_common::{RegistryError, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{CatalogClient, ServiceEntries};
use crate::model::{
    AgentServiceRegistration, STATUS_CRITICAL, STATUS_PASSING, entry_for, instance_from_entry,
    parse_duration,
};

struct Registered {
    registration: AgentServiceRegistration,
    ttl: Option<Duration>,
    deregister_after: Option<Duration>,
    critical: bool,
    /// Last pass, or when the check turned critical
    since: Instant,
    generation: u64,
}

#[derive(Default)]
struct State {
    services: BTreeMap<String, Registered>,
    next_generation: u64,
}

struct Inner {
    state: Mutex<State>,
    index: watch::Sender<u64>,
    available: AtomicBool,
}

/// Cloning yields another handle to the same catalog.
#[derive(Clone)]
pub struct MemoryCatalog {
    inner: Arc<Inner>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        let (index, _) = watch::channel(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                index,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the agent becoming unreachable (`false`) or reachable again.
    /// Blocked queries fail as soon as the agent goes away.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        self.inner.index.send_modify(|_| {});
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Current catalog index.
    pub fn index(&self) -> u64 {
        *self.inner.index.borrow()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.inner.state.lock().services.contains_key(service_id)
    }

    /// Whether the check of `service_id` currently passes.
    pub fn is_passing(&self, service_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .services
            .get(service_id)
            .is_some_and(|r| !r.critical)
    }

    /// Drop `service_id` as if an operator removed it.
    pub fn evict(&self, service_id: &str) {
        if self.inner.state.lock().services.remove(service_id).is_some() {
            self.inner.bump();
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RegistryError::unavailable("consul agent is offline"))
        }
    }
}

impl Inner {
    fn bump(&self) {
        self.index.send_modify(|index| *index += 1);
    }

    fn entries(&self, name: &str, passing_only: bool, index: u64) -> ServiceEntries {
        let state = self.state.lock();
        let instances = state
            .services
            .values()
            .filter(|r| r.registration.name == name)
            .filter(|r| !passing_only || !r.critical)
            .map(|r| {
                let status = if r.critical { STATUS_CRITICAL } else { STATUS_PASSING };
                instance_from_entry(&entry_for(&r.registration, status))
            })
            .collect();
        ServiceEntries { instances, index }
    }

    /// Next instant at which the health of `service_id` may change.
    fn next_transition(&self, service_id: &str, generation: u64) -> Option<Instant> {
        let state = self.state.lock();
        let registered = state
            .services
            .get(service_id)
            .filter(|r| r.generation == generation)?;
        if registered.critical {
            registered.deregister_after.map(|after| registered.since + after)
        } else {
            registered.ttl.map(|ttl| registered.since + ttl)
        }
    }

    fn evaluate(&self, service_id: &str, generation: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(registered) = state
            .services
            .get_mut(service_id)
            .filter(|r| r.generation == generation)
        else {
            return;
        };

        if !registered.critical {
            if registered.ttl.is_some_and(|ttl| now >= registered.since + ttl) {
                debug!("Check of {} turned critical", service_id);
                registered.critical = true;
                registered.since = now;
                drop(state);
                self.bump();
            }
        } else if registered
            .deregister_after
            .is_some_and(|after| now >= registered.since + after)
        {
            debug!("Deregistering critical service {}", service_id);
            state.services.remove(service_id);
            drop(state);
            self.bump();
        }
    }
}

/// Drives the TTL check of one registration generation.
async fn watch_health(inner: Weak<Inner>, service_id: String, generation: u64) {
    loop {
        let Some(deadline) = inner
            .upgrade()
            .and_then(|inner| inner.next_transition(&service_id, generation))
        else {
            return;
        };
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else { return };
        inner.evaluate(&service_id, generation);
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn service(
        &self,
        name: &str,
        wait_index: u64,
        wait: Duration,
        passing_only: bool,
    ) -> Result<ServiceEntries> {
        self.check_available()?;
        let mut rx = self.inner.index.subscribe();
        let deadline = Instant::now() + wait;

        loop {
            let index = *rx.borrow_and_update();
            if wait_index == 0 || index > wait_index {
                return Ok(self.inner.entries(name, passing_only, index));
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => self.check_available()?,
                Ok(Err(_)) | Err(_) => {
                    let index = *rx.borrow();
                    return Ok(self.inner.entries(name, passing_only, index));
                }
            }
        }
    }

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()> {
        self.check_available()?;
        let check = registration.check.as_ref();
        let ttl = check.and_then(|c| parse_duration(&c.ttl));
        let deregister_after =
            check.and_then(|c| parse_duration(&c.deregister_critical_service_after));
        let critical = check.is_some_and(|c| c.status != STATUS_PASSING);

        let generation = {
            let mut state = self.inner.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.services.insert(
                registration.id.clone(),
                Registered {
                    registration: registration.clone(),
                    ttl,
                    deregister_after,
                    critical,
                    since: Instant::now(),
                    generation,
                },
            );
            generation
        };
        self.inner.bump();

        if ttl.is_some() {
            tokio::spawn(watch_health(
                Arc::downgrade(&self.inner),
                registration.id.clone(),
                generation,
            ));
        }
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.check_available()?;
        self.evict(service_id);
        Ok(())
    }

    async fn pass_ttl(&self, check_id: &str) -> Result<()> {
        self.check_available()?;
        let recovered = {
            let mut state = self.inner.state.lock();
            let registered = state
                .services
                .values_mut()
                .find(|r| {
                    r.registration
                        .check
                        .as_ref()
                        .is_some_and(|c| c.check_id == check_id)
                })
                .ok_or_else(|| {
                    RegistryError::unavailable(format!("Unknown check ID \"{}\"", check_id))
                })?;
            registered.since = Instant::now();
            std::mem::replace(&mut registered.critical, false)
        };
        if recovered {
            self.inner.bump();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::registration_for;
    use servicerd_common::ServiceInstance;

    fn registration(id: &str, ttl: Duration) -> AgentServiceRegistration {
        registration_for(
            &ServiceInstance::new(id, "orders", vec![format!("http://10.0.0.1:{}", 8000)]),
            ttl,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_query_wakes_on_change() {
        let catalog = MemoryCatalog::new();
        let index = catalog
            .service("orders", 0, Duration::ZERO, true)
            .await
            .unwrap()
            .index;

        let writer = catalog.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer
                .register_service(&registration("a1", Duration::from_secs(15)))
                .await
                .unwrap();
        });

        let entries = catalog
            .service("orders", index, Duration::from_secs(30), true)
            .await
            .unwrap();
        assert!(entries.index > index);
        assert_eq!(entries.instances.len(), 1);
        assert_eq!(entries.instances[0].endpoints, vec!["http://10.0.0.1:8000".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_query_times_out_unchanged() {
        let catalog = MemoryCatalog::new();
        let started = Instant::now();
        let entries = catalog
            .service("orders", 1, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert_eq!(entries.index, 1);
        assert!(entries.instances.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_check_turns_critical_then_deregisters() {
        let catalog = MemoryCatalog::new();
        catalog
            .register_service(&registration("a1", Duration::from_secs(4)))
            .await
            .unwrap();
        assert!(catalog.is_passing("a1"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(catalog.contains("a1"));
        assert!(!catalog.is_passing("a1"));
        let passing = catalog.service("orders", 0, Duration::ZERO, true).await.unwrap();
        assert!(passing.instances.is_empty());
        let all = catalog.service("orders", 0, Duration::ZERO, false).await.unwrap();
        assert_eq!(all.instances.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!catalog.contains("a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_ttl_keeps_check_passing() {
        let catalog = MemoryCatalog::new();
        catalog
            .register_service(&registration("a1", Duration::from_secs(4)))
            .await
            .unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            catalog.pass_ttl("service:a1").await.unwrap();
        }
        assert!(catalog.is_passing("a1"));
        assert!(catalog.pass_ttl("service:zz").await.is_err());
    }

    #[tokio::test]
    async fn test_offline_agent_fails_calls() {
        let catalog = MemoryCatalog::new();
        catalog.set_available(false);
        let err = catalog
            .service("orders", 0, Duration::ZERO, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::StoreUnavailable(_)));
        catalog.set_available(true);
        assert!(catalog.service("orders", 0, Duration::ZERO, true).await.is_ok());
    }
}
