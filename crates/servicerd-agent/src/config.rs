//! Agent configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, `SERVICERD_`-prefixed environment variables (`__` separates
//! nesting levels, e.g. `SERVICERD_ETCD__ENDPOINTS`), then command-line
//! overrides.

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use servicerd_consul::{ConsulClientConfig, ConsulOptions};
use servicerd_etcd::{EtcdOptions, GatewayConfig};

pub const ENV_PREFIX: &str = "SERVICERD";

/// Store behind the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// etcd through its v3 JSON gateway
    #[default]
    Etcd,
    /// Consul agent HTTP API
    Consul,
    /// In-process lease store; only visible to this process
    Memory,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Etcd => "etcd",
            Backend::Consul => "consul",
            Backend::Memory => "memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EtcdSection {
    pub endpoints: Vec<String>,
    pub namespace: String,
    pub ttl_secs: u64,
    pub max_retry: u32,
    pub attempt_timeout_ms: u64,
    /// First re-registration backoff step
    pub retry_base_ms: u64,
    /// Cap on a single backoff delay
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for EtcdSection {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            namespace: servicerd_common::codec::DEFAULT_NAMESPACE.to_string(),
            ttl_secs: 15,
            max_retry: 5,
            attempt_timeout_ms: 3000,
            retry_base_ms: 1000,
            max_backoff_ms: 32_000,
            request_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

impl EtcdSection {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.endpoints.clone()).with_timeouts(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.request_timeout_ms),
        )
    }

    pub fn options(&self) -> EtcdOptions {
        EtcdOptions::default()
            .with_namespace(&self.namespace)
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_max_retry(self.max_retry)
            .with_attempt_timeout(Duration::from_millis(self.attempt_timeout_ms))
            .with_backoff(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.max_backoff_ms),
            )
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsulSection {
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub ttl_secs: u64,
    pub deregister_critical_after_secs: u64,
    pub blocking_wait_secs: u64,
    pub error_retry_delay_ms: u64,
    pub passing_only: bool,
    pub max_retry: u32,
    pub attempt_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConsulSection {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            ttl_secs: 15,
            deregister_critical_after_secs: 60,
            blocking_wait_secs: 55,
            error_retry_delay_ms: 1000,
            passing_only: true,
            max_retry: 5,
            attempt_timeout_ms: 3000,
            retry_base_ms: 1000,
            max_backoff_ms: 32_000,
            request_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

impl ConsulSection {
    pub fn client_config(&self) -> ConsulClientConfig {
        let mut config = ConsulClientConfig::new(self.address.clone()).with_timeouts(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.request_timeout_ms),
        );
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        if let Some(dc) = &self.datacenter {
            config = config.with_datacenter(dc.clone());
        }
        config
    }

    pub fn options(&self) -> ConsulOptions {
        ConsulOptions::default()
            .with_ttl(Duration::from_secs(self.ttl_secs))
            .with_deregister_critical_after(Duration::from_secs(self.deregister_critical_after_secs))
            .with_blocking_wait(Duration::from_secs(self.blocking_wait_secs))
            .with_error_retry_delay(Duration::from_millis(self.error_retry_delay_ms))
            .with_passing_only(self.passing_only)
            .with_max_retry(self.max_retry)
            .with_attempt_timeout(Duration::from_millis(self.attempt_timeout_ms))
            .with_backoff(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.max_backoff_ms),
            )
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON records instead of human-readable lines
    pub json: bool,
    /// Also write a daily rolling file into this directory
    pub dir: Option<String>,
    pub file_name: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
            file_name: "servicerd-agent.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: Backend,
    pub etcd: EtcdSection,
    pub consul: ConsulSection,
    pub log: LogSection,
}

/// Values given on the command line; `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<Backend>,
    pub etcd_endpoints: Option<Vec<String>>,
    pub consul_address: Option<String>,
    pub log_level: Option<String>,
}

impl AgentConfig {
    /// Load from `file` (when given), the environment and `overrides`.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("etcd.endpoints")
                .try_parsing(true),
        );
        Self::build(builder, overrides)
    }

    pub(crate) fn build(
        mut builder: ConfigBuilder<DefaultState>,
        overrides: &Overrides,
    ) -> Result<Self, config::ConfigError> {
        if let Some(backend) = overrides.backend {
            builder = builder.set_override("backend", backend.to_string())?;
        }
        if let Some(endpoints) = &overrides.etcd_endpoints {
            builder = builder.set_override("etcd.endpoints", endpoints.clone())?;
        }
        if let Some(address) = &overrides.consul_address {
            builder = builder.set_override("consul.address", address.clone())?;
        }
        if let Some(level) = &overrides.log_level {
            builder = builder.set_override("log.level", level.clone())?;
        }
        builder.build()?.try_deserialize()
    }
}
