//! servicerd common - shared building blocks for service registration and discovery
//!
//! This crate provides:
//! - `ServiceInstance`: the immutable description of one running process
//! - `Registry`, `Discovery` and `Watcher`: the contracts every backend implements
//! - `RegistryError`: the error taxonomy shared by all backends
//! - Codec and key helpers for storing instances in a key-value store
//! - `Backoff`: randomized exponential backoff with an injected random source
//! - `RegistryEvent` / `EventSink`: the structured lifecycle log collaborator

pub mod backoff;
pub mod codec;
pub mod error;
pub mod event;
pub mod model;
pub mod traits;

pub use backoff::Backoff;
pub use error::{RegistryError, Result};
pub use event::{EventSink, FnEventSink, RegistryEvent, TracingEventSink};
pub use model::ServiceInstance;
pub use traits::{Discovery, Registry, ServiceRegistry, Watcher};

// Re-exported so backends and callers agree on the cancellation type.
pub use tokio_util::sync::CancellationToken;
