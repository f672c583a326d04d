//! Catalog client abstraction
//!
//! `ConsulRegistry` only needs a handful of agent and health endpoints. The
//! `CatalogClient` trait covers exactly those so the HTTP client and the
//! in-process `MemoryCatalog` are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use servicerd_common::{Result, ServiceInstance};

use crate::model::AgentServiceRegistration;

/// Result of a (possibly blocking) health query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceEntries {
    pub instances: Vec<ServiceInstance>,
    /// Value of `X-Consul-Index` for this response
    pub index: u64,
}

#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    /// Instances of `name`.
    ///
    /// With `wait_index > 0` this is a blocking query: it returns once the
    /// catalog index moves past `wait_index` or after `wait`, whichever
    /// comes first.
    async fn service(
        &self,
        name: &str,
        wait_index: u64,
        wait: Duration,
        passing_only: bool,
    ) -> Result<ServiceEntries>;

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()>;

    /// Deregistering an unknown service id is not an error.
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Mark a TTL check as passing.
    async fn pass_ttl(&self, check_id: &str) -> Result<()>;
}
