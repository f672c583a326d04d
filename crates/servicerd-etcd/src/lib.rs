//! Lease-backed service registry
//!
//! Instances are written under `namespace/name/id`, bound to a lease with a
//! TTL, and kept alive by a per-registration heartbeat loop. When the
//! keep-alive stream is lost the loop re-registers with bounded, randomized
//! exponential backoff. Discovery reads the service prefix; watchers wake on
//! range-watch events and re-read the prefix.
//!
//! The store is reached through the `LeaseClient` contract. Two clients ship
//! with the crate: `EtcdGatewayClient` (etcd v3 JSON gateway over HTTP) and
//! `MemoryLeaseStore` (in-process, for embedded use and tests).

pub mod client;
pub mod gateway;
mod heartbeat;
pub mod memory;
pub mod options;
pub mod registry;
pub mod watcher;

pub use client::{
    KeepAliveResponse, KeepAliveStream, KeyValue, LeaseClient, LeaseId, WatchEvent,
    WatchEventKind, WatchStream,
};
pub use gateway::{EtcdGatewayClient, GatewayConfig};
pub use memory::MemoryLeaseStore;
pub use options::EtcdOptions;
pub use registry::EtcdRegistry;
pub use watcher::EtcdWatcher;
