//! Consul HTTP API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use servicerd_common::{RegistryError, Result};
use tracing::{debug, trace};
use url::Url;

use crate::client::{CatalogClient, ServiceEntries};
use crate::model::{AgentServiceRegistration, ServiceEntry, instance_from_entry};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Configuration for the Consul HTTP client
#[derive(Clone, Debug)]
pub struct ConsulClientConfig {
    /// Agent base URL, e.g. `http://127.0.0.1:8500`
    pub address: String,
    /// ACL token sent with every request
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub connect_timeout: Duration,
    /// Timeout for non-blocking calls; blocking queries add their wait on top
    pub request_timeout: Duration,
}

impl Default for ConsulClientConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsulClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

/// `CatalogClient` over the Consul agent HTTP API. Cheap to clone.
#[derive(Clone)]
pub struct ConsulHttpClient {
    client: Client,
    base: Url,
    config: ConsulClientConfig,
}

impl ConsulHttpClient {
    pub fn new(config: ConsulClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(RegistryError::unavailable)?;
        let base = Url::parse(&config.address).map_err(|e| {
            RegistryError::unavailable(format!("invalid agent address {}: {}", config.address, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::unavailable(format!(
                "invalid agent address {}",
                config.address
            )));
        }
        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Agent URL with each of `segments` percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.config.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    async fn execute(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::unavailable(format!("{}: {}", what, e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RegistryError::unavailable(format!(
                "{} returned {}: {}",
                what,
                status,
                text.trim()
            )));
        }
        Ok(response)
    }

    async fn put_agent(&self, segments: &[&str], body: Option<&AgentServiceRegistration>) -> Result<()> {
        let url = self.url(segments);
        let path = url.path().to_string();
        let mut request = self
            .authorize(self.client.put(url))
            .timeout(self.config.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request, &path).await?;
        Ok(())
    }
}

/// Parse `X-Consul-Index`, treating a missing or zero value as 1 so the
/// next query blocks instead of spinning.
fn response_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        .max(1)
}

#[async_trait]
impl CatalogClient for ConsulHttpClient {
    async fn service(
        &self,
        name: &str,
        wait_index: u64,
        wait: Duration,
        passing_only: bool,
    ) -> Result<ServiceEntries> {
        let url = self.url(&["v1", "health", "service", name]);
        let path = url.path().to_string();
        let mut request = self.authorize(self.client.get(url));
        if passing_only {
            request = request.query(&[("passing", "true")]);
        }
        let timeout = if wait_index > 0 {
            request = request.query(&[
                ("index", wait_index.to_string()),
                ("wait", format!("{}ms", wait.as_millis())),
            ]);
            // Consul adds up to wait/16 of jitter to a blocking query
            wait + wait / 16 + self.config.request_timeout
        } else {
            self.config.request_timeout
        };

        let response = self.execute(request.timeout(timeout), &path).await?;
        let index = response_index(&response);
        let entries: Vec<ServiceEntry> = response.json().await.map_err(RegistryError::unavailable)?;
        trace!("{} returned {} entries at index {}", path, entries.len(), index);

        Ok(ServiceEntries {
            instances: entries.iter().map(instance_from_entry).collect(),
            index,
        })
    }

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()> {
        self.put_agent(&["v1", "agent", "service", "register"], Some(registration))
            .await?;
        debug!("Registered service {} ({})", registration.name, registration.id);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let url = self.url(&["v1", "agent", "service", "deregister", service_id]);
        let path = url.path().to_string();
        let request = self
            .authorize(self.client.put(url))
            .timeout(self.config.request_timeout);
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::unavailable(format!("{}: {}", path, e)))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("Service {} was not registered", service_id);
                Ok(())
            }
            status => Err(RegistryError::unavailable(format!(
                "{} returned {}",
                path, status
            ))),
        }
    }

    async fn pass_ttl(&self, check_id: &str) -> Result<()> {
        self.put_agent(&["v1", "agent", "check", "pass", check_id], None)
            .await
    }
}
