//! Instance serialization and store key layout
//!
//! Instances are stored as compact JSON (`{"id","name","endpoints"}`) under
//! `namespace/serviceName/instanceID`.

use crate::error::Result;
use crate::model::ServiceInstance;

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "/microservices";

pub fn marshal(instance: &ServiceInstance) -> Result<String> {
    Ok(serde_json::to_string(instance)?)
}

pub fn unmarshal(data: &[u8]) -> Result<ServiceInstance> {
    Ok(serde_json::from_slice(data)?)
}

fn trim_namespace(namespace: &str) -> &str {
    namespace.trim_end_matches('/')
}

/// Key for a single instance: `namespace/name/id`
pub fn instance_key(namespace: &str, name: &str, id: &str) -> String {
    format!("{}/{}/{}", trim_namespace(namespace), name, id)
}

/// Prefix covering every instance of `name`, including the trailing separator
/// so that `orders` never matches `orders-v2`.
pub fn service_prefix(namespace: &str, name: &str) -> String {
    format!("{}/{}/", trim_namespace(namespace), name)
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `[0]` (the "whole keyspace" end) when the prefix is all `0xff`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
