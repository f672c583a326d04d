//! Options for the Consul-backed registry

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ConsulOptions {
    /// TTL of the health check attached to each registration
    pub ttl: Duration,
    /// How long a check may stay critical before Consul drops the service
    pub deregister_critical_after: Duration,
    /// Maximum time a blocking query waits for a change
    pub blocking_wait: Duration,
    /// Pause before re-polling after a failed blocking query
    pub error_retry_delay: Duration,
    /// Only report instances whose checks pass
    pub passing_only: bool,
    /// Re-registration attempts after the check can no longer be updated
    pub max_retry: u32,
    pub attempt_timeout: Duration,
    pub retry_base: Duration,
    pub max_backoff: Duration,
    /// Deadline applied to one-shot calls
    pub request_timeout: Duration,
    /// Parent of the registry's shutdown signal
    pub shutdown: Option<CancellationToken>,
}

impl Default for ConsulOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            deregister_critical_after: Duration::from_secs(60),
            blocking_wait: Duration::from_secs(55),
            error_retry_delay: Duration::from_secs(1),
            passing_only: true,
            max_retry: 5,
            attempt_timeout: Duration::from_secs(3),
            retry_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            request_timeout: Duration::from_secs(5),
            shutdown: None,
        }
    }
}

impl ConsulOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_deregister_critical_after(mut self, after: Duration) -> Self {
        self.deregister_critical_after = after;
        self
    }

    pub fn with_blocking_wait(mut self, wait: Duration) -> Self {
        self.blocking_wait = wait;
        self
    }

    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Bound on a single re-registration attempt.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_error_retry_delay(mut self, delay: Duration) -> Self {
        self.error_retry_delay = delay;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.max_backoff = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Interval between TTL check updates: half the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.ttl / 2).max(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConsulOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(15));
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(7500));
        assert_eq!(options.blocking_wait, Duration::from_secs(55));
        assert!(options.passing_only);
        assert_eq!(options.max_retry, 5);
    }

    #[test]
    fn test_builder() {
        let options = ConsulOptions::default()
            .with_ttl(Duration::from_secs(4))
            .with_passing_only(false)
            .with_blocking_wait(Duration::from_secs(5))
            .with_attempt_timeout(Duration::from_secs(1))
            .with_backoff(Duration::from_millis(500), Duration::from_secs(8));
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(options.attempt_timeout, Duration::from_secs(1));
        assert_eq!(options.retry_base, Duration::from_millis(500));
        assert_eq!(options.max_backoff, Duration::from_secs(8));
        assert!(!options.passing_only);
        assert_eq!(options.blocking_wait, Duration::from_secs(5));
    }
}
