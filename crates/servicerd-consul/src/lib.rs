//! Broadcast-backed service discovery
//!
//! One long-poll loop per watched service name feeds a shared `ServiceSet`,
//! which swaps in the new instance list and wakes every watcher of that name
//! through a coalescing single-slot signal. Registration uses a Consul agent
//! service with a TTL check kept passing by a heartbeat loop.

pub mod client;
mod heartbeat;
pub mod http;
pub mod memory;
pub mod model;
pub mod options;
pub mod registry;
pub mod service_set;
pub mod watcher;

pub use client::{CatalogClient, ServiceEntries};
pub use http::{ConsulClientConfig, ConsulHttpClient};
pub use memory::MemoryCatalog;
pub use options::ConsulOptions;
pub use registry::ConsulRegistry;
pub use service_set::ServiceSet;
pub use watcher::ConsulWatcher;
