//! Per-registration heartbeat loop
//!
//! Idles on the keep-alive stream. When the stream ends while the
//! registration is still wanted, re-grants a lease and re-puts the key, up to
//! `max_retry` attempts with randomized exponential backoff between them.
//! Every granted lease is recorded before its key is written, so an attempt
//! abandoned halfway still leaves the lease to be released on shutdown.

use std::sync::Arc;
use std::time::Duration;

use servicerd_common::{Backoff, EventSink, RegistryError, RegistryEvent, Result};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::{KeepAliveStream, LeaseClient, LeaseId};

/// Leases held by one registration, newest last. Empty once released.
pub(crate) type HeldLeases = Arc<Mutex<Vec<LeaseId>>>;

/// Grant a lease, record it in `held`, and write `key` under it.
///
/// Leases recorded by earlier attempts are revoked once the write has moved
/// the key onto the new lease. Fails with `Cancelled` when `cancel` fired
/// before the lease could be recorded.
pub(crate) async fn attach(
    client: &dyn LeaseClient,
    held: &HeldLeases,
    cancel: &CancellationToken,
    key: &str,
    value: &str,
    ttl: Duration,
) -> Result<LeaseId> {
    let lease = client.grant(ttl).await?;
    {
        let mut leases = held.lock().await;
        if cancel.is_cancelled() {
            drop(leases);
            let _ = client.revoke(lease).await;
            return Err(RegistryError::Cancelled);
        }
        leases.push(lease);
    }

    if let Err(e) = client.put(key, value, Some(lease)).await {
        let owned = {
            let mut leases = held.lock().await;
            let before = leases.len();
            leases.retain(|id| *id != lease);
            leases.len() != before
        };
        if owned {
            let _ = client.revoke(lease).await;
        }
        return Err(e);
    }

    let retired: Vec<LeaseId> = {
        let mut leases = held.lock().await;
        let retired = leases.iter().copied().filter(|id| *id != lease).collect();
        leases.retain(|id| *id == lease);
        retired
    };
    for old in retired {
        match client.revoke(old).await {
            Ok(()) => debug!("Revoked superseded lease {} of {}", old, key),
            Err(e) => debug!("Failed to revoke superseded lease {} of {}: {}", old, key, e),
        }
    }
    Ok(lease)
}

/// Revoke every lease in `held`, each bounded by `timeout`.
pub(crate) async fn release(client: &dyn LeaseClient, held: &HeldLeases, key: &str, timeout: Duration) {
    let leases = std::mem::take(&mut *held.lock().await);
    for lease in leases {
        match tokio::time::timeout(timeout, client.revoke(lease)).await {
            Ok(Ok(())) => debug!("Released lease {} for {}", lease, key),
            Ok(Err(e)) => warn!("Failed to release lease {} for {}: {}", lease, key, e),
            Err(_) => warn!("Timed out releasing lease {} for {}", lease, key),
        }
    }
}

pub(crate) struct Heartbeat {
    pub(crate) client: Arc<dyn LeaseClient>,
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) ttl: Duration,
    pub(crate) max_retry: u32,
    pub(crate) attempt_timeout: Duration,
    pub(crate) backoff: Arc<Backoff>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) leases: HeldLeases,
    pub(crate) cancel: CancellationToken,
}

impl Heartbeat {
    pub(crate) async fn run(self, lease: LeaseId) {
        let mut stream = match self.client.keep_alive(lease).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Failed to start keep-alive for {}: {}", self.key, e);
                None
            }
        };
        let mut last_ack = Instant::now();

        loop {
            if stream.is_none() {
                match self.recover().await {
                    Some(recovered) => {
                        stream = Some(recovered);
                        last_ack = Instant::now();
                    }
                    None => break,
                }
            }
            let Some(current) = stream.as_mut() else { break };

            let lost = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                ack = current.message() => match ack {
                    Some(ack) => {
                        trace!("Keep-alive ack for {} (lease {}, ttl {:?})", self.key, ack.id, ack.ttl);
                        last_ack = Instant::now();
                        false
                    }
                    None => true,
                },
            };

            if lost {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.events.on_event(&RegistryEvent::KeepAliveLost {
                    key: self.key.clone(),
                    elapsed: last_ack.elapsed(),
                });
                stream = None;
            }
        }

        release(self.client.as_ref(), &self.leases, &self.key, self.attempt_timeout).await;
        debug!("Heartbeat for {} stopped", self.key);
    }

    /// Re-registration retry sequence. `None` when cancelled or exhausted.
    async fn recover(&self) -> Option<KeepAliveStream> {
        let started = Instant::now();

        for attempt in 1..=self.max_retry {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
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
                Ok(stream) => {
                    self.events.on_event(&RegistryEvent::RetrySucceeded {
                        key: self.key.clone(),
                        attempt,
                        elapsed: started.elapsed(),
                    });
                    return Some(stream);
                }
                Err(RegistryError::Cancelled) => return None,
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
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.events.on_event(&RegistryEvent::RetriesExhausted {
            key: self.key.clone(),
            attempts: self.max_retry,
            elapsed: started.elapsed(),
        });
        None
    }

    /// Grant a fresh lease, re-put the key under it, and resume keep-alive.
    async fn reregister(&self) -> Result<KeepAliveStream> {
        let lease = attach(
            self.client.as_ref(),
            &self.leases,
            &self.cancel,
            &self.key,
            &self.value,
            self.ttl,
        )
        .await?;
        self.client.keep_alive(lease).await
    }
}
