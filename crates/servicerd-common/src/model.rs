//! Service instance data model

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RegistryError, Result};

/// One running process of a logical service.
///
/// Instances are values: an update is a deregister followed by a register,
/// never an in-place mutation of something already published.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Globally unique per process (e.g. `host:pid` or a UUID)
    pub id: String,
    /// Logical service name shared by every instance of the service
    pub name: String,
    /// Reachable addresses in `scheme://host:port` form
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoints,
        }
    }

    /// Check the invariants required before an instance may be published.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidInstance(
                "instance id must not be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidInstance(
                "instance name must not be empty".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            parse_endpoint(endpoint)?;
        }
        Ok(())
    }

    /// Find the first endpoint using `scheme`.
    pub fn endpoint(&self, scheme: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| {
                e.split_once("://")
                    .is_some_and(|(s, _)| s.eq_ignore_ascii_case(scheme))
            })
            .map(String::as_str)
    }
}

/// Parsed form of an endpoint string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Parse `scheme://host:port`. The port may only be omitted for schemes with a
/// well-known default (`http`, `https`, ...).
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint> {
    let url = Url::parse(endpoint)
        .map_err(|e| RegistryError::InvalidInstance(format!("endpoint '{}': {}", endpoint, e)))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RegistryError::InvalidInstance(format!("endpoint '{}' has no host", endpoint)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RegistryError::InvalidInstance(format!("endpoint '{}' has no port", endpoint)))?;

    Ok(Endpoint {
        scheme: url.scheme().to_string(),
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
    })
}
