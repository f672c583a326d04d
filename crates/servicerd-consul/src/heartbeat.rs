//! Per-registration TTL heartbeat
//!
//! Marks the registration's TTL check as passing every half TTL. When an
//! update fails the service is re-registered, up to `max_retry` attempts
//! with randomized exponential backoff between them.

use std::sync::Arc;
use std::time::Duration;

use servicerd_common::{Backoff, EventSink, RegistryError, RegistryEvent, Result};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::CatalogClient;
use crate::model::{AgentServiceRegistration, check_id};

/// Serializes re-registration attempts with deregistration.
pub(crate) type RegistrationGate = Arc<Mutex<()>>;

pub(crate) struct Heartbeat {
    pub(crate) client: Arc<dyn CatalogClient>,
    pub(crate) key: String,
    pub(crate) registration: AgentServiceRegistration,
    pub(crate) interval: Duration,
    pub(crate) max_retry: u32,
    pub(crate) attempt_timeout: Duration,
    pub(crate) backoff: Arc<Backoff>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) gate: RegistrationGate,
    pub(crate) cancel: CancellationToken,
}

impl Heartbeat {
    pub(crate) async fn run(self) {
        let check = check_id(&self.registration.id);
        let mut last_pass = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let error = match tokio::time::timeout(self.attempt_timeout, self.client.pass_ttl(&check)).await {
                Ok(Ok(())) => {
                    trace!("TTL check {} passed", check);
                    last_pass = Instant::now();
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("check update timed out after {:?}", self.attempt_timeout),
            };

            if self.cancel.is_cancelled() {
                break;
            }
            debug!("Failed to update TTL check {}: {}", check, error);
            self.events.on_event(&RegistryEvent::KeepAliveLost {
                key: self.key.clone(),
                elapsed: last_pass.elapsed(),
            });

            if !self.recover().await {
                break;
            }
            last_pass = Instant::now();
        }

        debug!("Heartbeat for {} stopped", self.key);
    }

    /// Re-registration retry sequence. `false` when cancelled or exhausted.
    async fn recover(&self) -> bool {
        let started = Instant::now();

        for attempt in 1..=self.max_retry {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                result = tokio::time::timeout(self.attempt_timeout, self.reregister()) => {
                    result.unwrap_or_else(|_| {
                        Err(RegistryError::unavailable(format!(
                            "attempt timed out after {:?}",
                            self.attempt_timeout
                        )))
                    })
                }
            };

            let error = match result {
                Ok(()) => {
                    self.events.on_event(&RegistryEvent::RetrySucceeded {
                        key: self.key.clone(),
                        attempt,
                        elapsed: started.elapsed(),
                    });
                    return true;
                }
                Err(RegistryError::Cancelled) => return false,
                Err(e) => e,
            };

            if attempt == self.max_retry {
                warn!(
                    "Re-registration attempt {} for {} failed: {}",
                    attempt, self.key, error
                );
                break;
            }

            let delay = self.backoff.delay(attempt);
            self.events.on_event(&RegistryEvent::RetryScheduled {
                key: self.key.clone(),
                attempt,
                delay,
                error: error.to_string(),
            });
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.events.on_event(&RegistryEvent::RetriesExhausted {
            key: self.key.clone(),
            attempts: self.max_retry,
            elapsed: started.elapsed(),
        });
        false
    }

    async fn reregister(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.cancel.is_cancelled() {
            // Deregistered while waiting for the gate
            return Err(RegistryError::Cancelled);
        }
        self.client.register_service(&self.registration).await
    }
}
