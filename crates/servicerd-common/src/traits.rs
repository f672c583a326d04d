//! Registry, discovery, and watcher contracts
//!
//! Backends implement `Registry` and `Discovery`; callers hold them through
//! `ServiceRegistry` so the concrete store is chosen once, at construction.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::ServiceInstance;

/// Publishes and withdraws instances.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish `instance` and keep it alive in the background.
    ///
    /// Fails with `AlreadyRegistered` if a live entry with the same identity
    /// exists. The background liveness loop is owned by the registry, not by
    /// the caller of this method.
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// Remove `instance` and release its lease. Removing an absent instance
    /// is not an error.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// Point-in-time existence check. Races with concurrent expiry, so it is
    /// not a liveness probe.
    async fn is_registered(&self, instance: &ServiceInstance) -> Result<bool>;
}

/// Looks up instances and subscribes to changes.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every currently known live instance of `name`, in no particular order.
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// Subscribe to changes of `name`. `cancel` acts as the caller context for
    /// every `Watcher::next` call on the returned watcher.
    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<Box<dyn Watcher>>;
}

/// A subscription to one service name.
///
/// `next` only signals that something changed; the current instance set is
/// read through `snapshot`. Signals coalesce, so a slow consumer wakes once
/// and then observes the latest state rather than a backlog.
#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next change.
    ///
    /// Returns `Cancelled` when the watch's cancellation token fires and
    /// `Closed` once the watcher has been closed.
    async fn next(&mut self) -> Result<()>;

    /// The latest known instance set.
    fn snapshot(&self) -> Arc<Vec<ServiceInstance>>;

    /// Stop watching. Idempotent; never affects other watchers of the same name.
    fn close(&mut self);
}

/// A backend offering both halves of the contract.
pub trait ServiceRegistry: Registry + Discovery {}

impl<T: Registry + Discovery> ServiceRegistry for T {}
