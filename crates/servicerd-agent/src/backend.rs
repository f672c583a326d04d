//! Backend selection
//!
//! The store is chosen once, here; everything after construction talks to
//! `dyn ServiceRegistry`.

use std::sync::Arc;

use servicerd_common::ServiceRegistry;
use servicerd_consul::{ConsulHttpClient, ConsulRegistry};
use servicerd_etcd::{EtcdGatewayClient, EtcdRegistry, MemoryLeaseStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AgentConfig, Backend};

/// A constructed registry plus the handle needed to shut it down.
pub enum RegistryHandle {
    Etcd(Arc<EtcdRegistry>),
    Consul(Arc<ConsulRegistry>),
}

impl RegistryHandle {
    pub fn registry(&self) -> Arc<dyn ServiceRegistry> {
        match self {
            RegistryHandle::Etcd(registry) => registry.clone(),
            RegistryHandle::Consul(registry) => registry.clone(),
        }
    }

    /// Stop heartbeats and watchers, releasing what was registered.
    pub async fn close(&self) {
        match self {
            RegistryHandle::Etcd(registry) => registry.close().await,
            RegistryHandle::Consul(registry) => registry.close().await,
        }
    }
}

/// Build the registry selected by `config`, bound to `shutdown`.
pub fn build_registry(
    config: &AgentConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<RegistryHandle> {
    let handle = match config.backend {
        Backend::Etcd => {
            let client = EtcdGatewayClient::new(config.etcd.gateway_config())?;
            let options = config.etcd.options().with_shutdown(shutdown.clone());
            info!("Using etcd at {:?}", config.etcd.endpoints);
            RegistryHandle::Etcd(Arc::new(EtcdRegistry::new(Arc::new(client), options)))
        }
        Backend::Consul => {
            let client = ConsulHttpClient::new(config.consul.client_config())?;
            let options = config.consul.options().with_shutdown(shutdown.clone());
            info!("Using consul at {}", config.consul.address);
            RegistryHandle::Consul(Arc::new(ConsulRegistry::new(Arc::new(client), options)))
        }
        Backend::Memory => {
            let options = config.etcd.options().with_shutdown(shutdown.clone());
            info!("Using in-process store");
            RegistryHandle::Etcd(Arc::new(EtcdRegistry::new(
                Arc::new(MemoryLeaseStore::new()),
                options,
            )))
        }
    };
    Ok(handle)
}
