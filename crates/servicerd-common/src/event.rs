//! Registration lifecycle events and the sink that records them
//!
//! Backends report every lifecycle transition to an injected `EventSink`.
//! The default sink writes structured `tracing` records.

use std::time::Duration;

use tracing::{debug, error, info, warn};

/// A lifecycle transition of one registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The instance was written to the store and its heartbeat started.
    Initialized { key: String, service: String },
    /// A one-shot registration failed.
    RegistrationFailed {
        key: String,
        service: String,
        error: String,
    },
    /// The keep-alive stream ended while the registration was still wanted.
    KeepAliveLost { key: String, elapsed: Duration },
    /// A re-registration attempt failed and another is scheduled after `delay`.
    RetryScheduled {
        key: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Re-registration succeeded.
    RetrySucceeded {
        key: String,
        attempt: u32,
        elapsed: Duration,
    },
    /// All re-registration attempts failed; the registration is gone.
    RetriesExhausted {
        key: String,
        attempts: u32,
        elapsed: Duration,
    },
    /// The instance was removed on request.
    Deregistered { key: String, service: String },
}

impl RegistryEvent {
    /// Short event name, stable for log queries.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::Initialized { .. } => "initialized",
            RegistryEvent::RegistrationFailed { .. } => "registration_failed",
            RegistryEvent::KeepAliveLost { .. } => "keepalive_lost",
            RegistryEvent::RetryScheduled { .. } => "retry_scheduled",
            RegistryEvent::RetrySucceeded { .. } => "retry_succeeded",
            RegistryEvent::RetriesExhausted { .. } => "retries_exhausted",
            RegistryEvent::Deregistered { .. } => "deregistered",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            RegistryEvent::Initialized { key, .. }
            | RegistryEvent::RegistrationFailed { key, .. }
            | RegistryEvent::KeepAliveLost { key, .. }
            | RegistryEvent::RetryScheduled { key, .. }
            | RegistryEvent::RetrySucceeded { key, .. }
            | RegistryEvent::RetriesExhausted { key, .. }
            | RegistryEvent::Deregistered { key, .. } => key,
        }
    }
}

/// Receiver of registration lifecycle events.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: &RegistryEvent);
}

/// Sink that emits each event as a structured `tracing` record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &RegistryEvent) {
        let name = event.name();
        match event {
            RegistryEvent::Initialized { key, service } => {
                info!(event = name, key = %key, service = %service, "registration initialized");
            }
            RegistryEvent::RegistrationFailed {
                key,
                service,
                error,
            } => {
                warn!(event = name, key = %key, service = %service, error = %error, "registration failed");
            }
            RegistryEvent::KeepAliveLost { key, elapsed } => {
                warn!(
                    event = name,
                    key = %key,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "keep-alive lost, re-registering"
                );
            }
            RegistryEvent::RetryScheduled {
                key,
                attempt,
                delay,
                error,
            } => {
                debug!(
                    event = name,
                    key = %key,
                    attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "re-registration retry scheduled"
                );
            }
            RegistryEvent::RetrySucceeded {
                key,
                attempt,
                elapsed,
            } => {
                info!(
                    event = name,
                    key = %key,
                    attempt = *attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "re-registration succeeded"
                );
            }
            RegistryEvent::RetriesExhausted {
                key,
                attempts,
                elapsed,
            } => {
                error!(
                    event = name,
                    key = %key,
                    attempts = *attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "re-registration retries exhausted, registration lost"
                );
            }
            RegistryEvent::Deregistered { key, service } => {
                info!(event = name, key = %key, service = %service, "deregistered");
            }
        }
    }
}

/// Sink that invokes a closure.
pub struct FnEventSink<F>
where
    F: Fn(&RegistryEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnEventSink<F>
where
    F: Fn(&RegistryEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventSink for FnEventSink<F>
where
    F: Fn(&RegistryEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &RegistryEvent) {
        (self.f)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_event_names() {
        let event = RegistryEvent::RetryScheduled {
            key: "/ns/orders/a1".to_string(),
            attempt: 2,
            delay: Duration::from_secs(2),
            error: "down".to_string(),
        };
        assert_eq!(event.name(), "retry_scheduled");
        assert_eq!(event.key(), "/ns/orders/a1");
    }

    #[test]
    fn test_fn_event_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = FnEventSink::new(move |event: &RegistryEvent| {
            seen_clone.lock().push(event.name());
        });

        sink.on_event(&RegistryEvent::Initialized {
            key: "k".to_string(),
            service: "orders".to_string(),
        });
        sink.on_event(&RegistryEvent::Deregistered {
            key: "k".to_string(),
            service: "orders".to_string(),
        });

        assert_eq!(*seen.lock(), vec!["initialized", "deregistered"]);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingEventSink;
        sink.on_event(&RegistryEvent::KeepAliveLost {
            key: "k".to_string(),
            elapsed: Duration::from_millis(5),
        });
        sink.on_event(&RegistryEvent::RetriesExhausted {
            key: "k".to_string(),
            attempts: 5,
            elapsed: Duration::from_secs(30),
        });
    }
}
