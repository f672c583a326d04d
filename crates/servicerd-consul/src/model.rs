//! Consul agent and health API models
//!
//! Field names follow the Consul HTTP API. Each endpoint of an instance is
//! stored as a tagged address keyed by its URL scheme, with the full URL as
//! the address, so a reader can rebuild the endpoint list.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use servicerd_common::model::parse_endpoint;
use servicerd_common::{RegistryError, Result, ServiceInstance};

/// Tagged address keys Consul fills in on its own.
const RESERVED_ADDRESS_KEYS: [&str; 6] = ["lan", "lan_ipv4", "lan_ipv6", "wan", "wan_ipv4", "wan_ipv6"];

pub const STATUS_PASSING: &str = "passing";
pub const STATUS_CRITICAL: &str = "critical";

/// Consul sends `null` for empty maps and lists.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of `PUT /v1/agent/service/register`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Address", default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(
        rename = "TaggedAddresses",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,

    #[serde(
        rename = "Meta",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub meta: BTreeMap<String, String>,

    #[serde(rename = "Check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddress {
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,
}

/// TTL check definition embedded in a registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,

    #[serde(rename = "TTL")]
    pub ttl: String,

    #[serde(rename = "DeregisterCriticalServiceAfter", default, skip_serializing_if = "String::is_empty")]
    pub deregister_critical_service_after: String,

    /// Initial status; Consul starts TTL checks critical when omitted
    #[serde(rename = "Status", default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// One element of `GET /v1/health/service/{name}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(rename = "Service")]
    pub service: AgentService,

    #[serde(rename = "Checks", default, deserialize_with = "null_as_default")]
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Service")]
    pub service: String,

    #[serde(rename = "Address", default)]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(rename = "TaggedAddresses", default, deserialize_with = "null_as_default")]
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,

    #[serde(rename = "Meta", default, deserialize_with = "null_as_default")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,

    #[serde(rename = "Status")]
    pub status: String,
}

/// Check id of the TTL check attached to `service_id`.
pub fn check_id(service_id: &str) -> String {
    format!("service:{}", service_id)
}

/// Format a duration the way Consul parses them ("15s", "500ms").
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis().max(1))
    }
}

/// Parse the subset of Go duration strings produced by `format_duration`
/// plus minutes and hours.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3600)),
        _ => None,
    }
}

/// Build the agent registration for `instance`.
///
/// The first endpoint also fills `Address`/`Port` for clients that ignore
/// tagged addresses. Two endpoints sharing a scheme are rejected since they
/// would collide on the same tagged address key.
pub fn registration_for(
    instance: &ServiceInstance,
    ttl: Duration,
    deregister_critical_after: Duration,
) -> Result<AgentServiceRegistration> {
    let mut registration = AgentServiceRegistration {
        id: instance.id.clone(),
        name: instance.name.clone(),
        check: Some(AgentServiceCheck {
            check_id: check_id(&instance.id),
            ttl: format_duration(ttl),
            deregister_critical_service_after: format_duration(deregister_critical_after),
            status: STATUS_PASSING.to_string(),
        }),
        ..Default::default()
    };

    for raw in &instance.endpoints {
        let endpoint = parse_endpoint(raw)?;
        if RESERVED_ADDRESS_KEYS.contains(&endpoint.scheme.as_str()) {
            return Err(RegistryError::InvalidInstance(format!(
                "endpoint scheme {} is reserved",
                endpoint.scheme
            )));
        }
        if registration.address.is_empty() {
            registration.address = endpoint.host.clone();
            registration.port = endpoint.port;
        }
        let address = ServiceAddress {
            address: raw.clone(),
            port: endpoint.port,
        };
        if registration
            .tagged_addresses
            .insert(endpoint.scheme.clone(), address)
            .is_some()
        {
            return Err(RegistryError::InvalidInstance(format!(
                "more than one {} endpoint",
                endpoint.scheme
            )));
        }
    }

    Ok(registration)
}

/// Rebuild an instance from a health entry.
///
/// Endpoints come from non-reserved tagged addresses in key order; entries
/// registered without any fall back to `http://Address:Port`.
pub fn instance_from_entry(entry: &ServiceEntry) -> ServiceInstance {
    let service = &entry.service;
    let mut endpoints: Vec<String> = service
        .tagged_addresses
        .iter()
        .filter(|(scheme, _)| !RESERVED_ADDRESS_KEYS.contains(&scheme.as_str()))
        .map(|(_, address)| address.address.clone())
        .collect();

    if endpoints.is_empty() && !service.address.is_empty() && service.port != 0 {
        endpoints.push(format!("http://{}:{}", service.address, service.port));
    }

    ServiceInstance::new(service.id.clone(), service.service.clone(), endpoints)
}

/// The entry the agent would report for `registration`.
pub fn entry_for(registration: &AgentServiceRegistration, status: &str) -> ServiceEntry {
    ServiceEntry {
        service: AgentService {
            id: registration.id.clone(),
            service: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tagged_addresses: registration.tagged_addresses.clone(),
            meta: registration.meta.clone(),
        },
        checks: registration
            .check
            .iter()
            .map(|check| HealthCheck {
                check_id: check.check_id.clone(),
                status: status.to_string(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(endpoints: &[&str]) -> ServiceInstance {
        ServiceInstance::new(
            "a1",
            "orders",
            endpoints.iter().map(|e| e.to_string()).collect(),
        )
    }

    #[test]
    fn test_registration_for() {
        let registration = registration_for(
            &instance(&["http://10.0.0.1:8080", "grpc://10.0.0.1:9000"]),
            Duration::from_secs(15),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(registration.id, "a1");
        assert_eq!(registration.address, "10.0.0.1");
        assert_eq!(registration.port, 8080);
        assert_eq!(registration.tagged_addresses["grpc"].address, "grpc://10.0.0.1:9000");
        assert_eq!(registration.tagged_addresses["grpc"].port, 9000);

        let check = registration.check.unwrap();
        assert_eq!(check.check_id, "service:a1");
        assert_eq!(check.ttl, "15s");
        assert_eq!(check.deregister_critical_service_after, "60s");
        assert_eq!(check.status, "passing");
    }

    #[test]
    fn test_registration_rejects_duplicate_scheme() {
        let err = registration_for(
            &instance(&["http://10.0.0.1:8080", "http://10.0.0.1:8081"]),
            Duration::from_secs(15),
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInstance(_)));
    }

    #[test]
    fn test_registration_serializes_consul_names() {
        let registration = registration_for(
            &instance(&["http://10.0.0.1:8080"]),
            Duration::from_secs(15),
            Duration::from_secs(60),
        )
        .unwrap();
        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["ID"], "a1");
        assert_eq!(json["Name"], "orders");
        assert_eq!(json["TaggedAddresses"]["http"]["Address"], "http://10.0.0.1:8080");
        assert_eq!(json["Check"]["TTL"], "15s");
        assert!(json.get("Meta").is_none());
    }

    #[test]
    fn test_instance_from_entry_skips_reserved_addresses() {
        let json = r#"{
            "Service": {
                "ID": "a1",
                "Service": "orders",
                "Address": "10.0.0.1",
                "Port": 8080,
                "TaggedAddresses": {
                    "lan_ipv4": {"Address": "10.0.0.1", "Port": 8080},
                    "http": {"Address": "http://10.0.0.1:8080", "Port": 8080},
                    "grpc": {"Address": "grpc://10.0.0.1:9000", "Port": 9000}
                },
                "Meta": null
            },
            "Checks": [{"CheckID": "service:a1", "Status": "passing"}]
        }"#;
        let entry: ServiceEntry = serde_json::from_str(json).unwrap();
        let instance = instance_from_entry(&entry);
        assert_eq!(instance.id, "a1");
        assert_eq!(instance.name, "orders");
        assert_eq!(
            instance.endpoints,
            vec!["grpc://10.0.0.1:9000".to_string(), "http://10.0.0.1:8080".to_string()]
        );
    }

    #[test]
    fn test_instance_from_entry_falls_back_to_address() {
        let json = r#"{"Service": {"ID": "b1", "Service": "billing", "Address": "10.0.0.2", "Port": 80, "TaggedAddresses": null}, "Checks": null}"#;
        let entry: ServiceEntry = serde_json::from_str(json).unwrap();
        assert_eq!(instance_from_entry(&entry).endpoints, vec!["http://10.0.0.2:80".to_string()]);
    }

    #[test]
    fn test_duration_format() {
        assert_eq!(format_duration(Duration::from_secs(15)), "15s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("soon"), None);
    }
}
