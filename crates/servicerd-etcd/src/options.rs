//! Options for the lease-backed registry

use std::time::Duration;

use servicerd_common::codec::DEFAULT_NAMESPACE;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct EtcdOptions {
    /// Key prefix under which instances are stored
    pub namespace: String,
    /// Lease time-to-live
    pub ttl: Duration,
    /// Re-registration attempts before a lost registration is abandoned
    pub max_retry: u32,
    /// Upper bound on a single re-registration attempt
    pub attempt_timeout: Duration,
    /// Smallest backoff step between re-registration attempts
    pub retry_base: Duration,
    /// Largest backoff step between re-registration attempts
    pub max_backoff: Duration,
    /// Deadline applied to one-shot store calls
    pub request_timeout: Duration,
    /// Parent of the registry's shutdown signal
    pub shutdown: Option<CancellationToken>,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: Duration::from_secs(15),
            max_retry: 5,
            attempt_timeout: Duration::from_secs(3),
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            request_timeout: Duration::from_secs(5),
            shutdown: None,
        }
    }
}

impl EtcdOptions {
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the backoff bounds used between re-registration attempts
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Tie the registry's lifetime to `token`: cancelling it stops every heartbeat.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }
}
